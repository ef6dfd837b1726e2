// Teleop runtime for a two-wheel hoverboard-motor robot
//
// HTTP control surface, telemetry sampling, camera streaming, keyboard teleop
// and controller bring-up, all over one motor-controller abstraction.

pub mod bringup;
pub mod camera;
pub mod config;
pub mod control;
pub mod input;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod server;
pub mod status;
pub mod teleop;

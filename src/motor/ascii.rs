// ASCII line protocol over the controller's UART / USB CDC port
//
// One command per line, newline-terminated:
//   r <field>                read a field, controller replies with one line
//   w <field> <value>        write a field, no reply
//   v <axis> <velocity>      velocity setpoint shorthand, no reply
//   ss                       save configuration, no reply
//
// Replies are strictly ordered. A reply that misses its timeout still arrives
// eventually, so it is skipped before the next query is sent.

use serialport::{self, DataBits, Parity, SerialPort, StopBits};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

use super::controller::{Axis, ControllerError, MotorController, Result, Value};

/// Replies the firmware sends instead of a value when a command is rejected
const REJECTION_MARKERS: [&str; 3] = ["invalid", "unknown", "error"];

/// Controller bus speaking the ASCII protocol over any byte transport
pub struct AsciiBus<T: Read + Write + Send = Box<dyn SerialPort>> {
    link: BufReader<T>,
    /// Bytes of a reply line cut short by a timeout
    partial: String,
    /// Queries whose reply timed out and may still be in flight
    unanswered: usize,
}

impl AsciiBus {
    /// Open a serial port with custom baudrate and read timeout (8N1)
    pub fn open_with(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()?;

        Ok(Self::new(port))
    }
}

impl<T: Read + Write + Send> AsciiBus<T> {
    /// Wrap an already-open transport
    pub fn new(transport: T) -> Self {
        Self {
            link: BufReader::new(transport),
            partial: String::new(),
            unanswered: 0,
        }
    }

    /// Access the underlying transport
    pub fn get_ref(&self) -> &T {
        self.link.get_ref()
    }

    /// Send one command line
    fn send_line(&mut self, command: &str) -> Result<()> {
        debug!("-> {}", command);
        let port = self.link.get_mut();
        port.write_all(command.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    /// Read one reply line, without the terminator
    fn read_line(&mut self, command: &str) -> Result<String> {
        let read = self.link.read_line(&mut self.partial).map_err(|e| {
            if e.kind() == ErrorKind::TimedOut {
                ControllerError::Timeout {
                    command: command.to_string(),
                }
            } else {
                ControllerError::Io(e)
            }
        })?;

        if read == 0 || !self.partial.ends_with('\n') {
            return Err(ControllerError::Timeout {
                command: command.to_string(),
            });
        }

        let reply = self.partial.trim().to_string();
        self.partial.clear();
        debug!("<- {}", reply);
        Ok(reply)
    }

    /// Drop replies to earlier queries that timed out
    fn skip_late_replies(&mut self) -> Result<()> {
        while self.unanswered > 0 {
            match self.read_line("late reply") {
                Ok(reply) => {
                    debug!("Discarding late reply: {}", reply);
                    self.unanswered -= 1;
                }
                Err(ControllerError::Timeout { .. }) => {
                    debug!("{} late replies never arrived", self.unanswered);
                    self.unanswered = 0;
                    self.partial.clear();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send a command and wait for its single-line reply
    pub fn query(&mut self, command: &str) -> Result<String> {
        self.skip_late_replies()?;
        self.send_line(command)?;
        match self.read_line(command) {
            Err(e @ ControllerError::Timeout { .. }) => {
                self.unanswered += 1;
                Err(e)
            }
            other => other,
        }
    }
}

/// Parse a numeric reply, rejecting firmware diagnostics
fn parse_reply(command: &str, reply: &str) -> Result<f32> {
    let lowered = reply.to_ascii_lowercase();
    let rejected = REJECTION_MARKERS.iter().any(|m| lowered.contains(m));

    match reply.parse::<f32>() {
        Ok(value) if !rejected => Ok(value),
        _ => Err(ControllerError::InvalidResponse {
            command: command.to_string(),
            reply: reply.to_string(),
        }),
    }
}

impl<T: Read + Write + Send> MotorController for AsciiBus<T> {
    fn read(&mut self, field: &str) -> Result<f32> {
        let command = format!("r {}", field);
        let reply = self.query(&command)?;
        parse_reply(&command, &reply)
    }

    fn write(&mut self, field: &str, value: Value) -> Result<()> {
        self.send_line(&format!("w {} {}", field, value))
    }

    fn set_velocity(&mut self, axis: Axis, velocity: f32) -> Result<()> {
        self.send_line(&format!("v {} {}", axis.index(), velocity))
    }

    fn save_configuration(&mut self) -> Result<()> {
        self.send_line("ss")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::AxisState;
    use std::io::Cursor;

    /// In-memory transport: replies are pre-loaded, commands are captured
    struct Loopback {
        replies: Cursor<Vec<u8>>,
        sent: Vec<u8>,
    }

    impl Loopback {
        fn new(replies: &str) -> Self {
            Self {
                replies: Cursor::new(replies.as_bytes().to_vec()),
                sent: Vec::new(),
            }
        }

        fn sent(&self) -> String {
            String::from_utf8(self.sent.clone()).unwrap()
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.replies.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_formats_command_and_parses_reply() {
        let mut bus = AsciiBus::new(Loopback::new("15.84\r\n"));
        let volts = bus.read("vbus_voltage").unwrap();
        assert!((volts - 15.84).abs() < 1e-4);
        assert_eq!(bus.get_ref().sent(), "r vbus_voltage\n");
    }

    #[test]
    fn test_write_and_velocity_lines() {
        let mut bus = AsciiBus::new(Loopback::new(""));
        bus.request_state(Axis::Axis1, AxisState::Idle).unwrap();
        bus.set_velocity(Axis::Axis0, -0.5).unwrap();
        bus.write("axis0.motor.config.pre_calibrated", true.into())
            .unwrap();
        bus.save_configuration().unwrap();
        assert_eq!(
            bus.get_ref().sent(),
            "w axis1.requested_state 1\nv 0 -0.5\nw axis0.motor.config.pre_calibrated 1\nss\n"
        );
    }

    #[test]
    fn test_current_state_reads_axis_field() {
        let mut bus = AsciiBus::new(Loopback::new("8\n"));
        let state = bus.current_state(Axis::Axis0).unwrap();
        assert_eq!(state, AxisState::ClosedLoopControl);
        assert_eq!(bus.get_ref().sent(), "r axis0.current_state\n");
    }

    #[test]
    fn test_rejected_reply() {
        let mut bus = AsciiBus::new(Loopback::new("invalid property\n"));
        match bus.read("axis0.nope") {
            Err(ControllerError::InvalidResponse { command, reply }) => {
                assert_eq!(command, "r axis0.nope");
                assert_eq!(reply, "invalid property");
            }
            other => panic!("expected InvalidResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_silent_port_times_out() {
        let mut bus = AsciiBus::new(Loopback::new(""));
        assert!(matches!(
            bus.read("vbus_voltage"),
            Err(ControllerError::Timeout { .. })
        ));
    }

    /// Loopback whose first reads time out
    struct SlowLink {
        timeouts: usize,
        inner: Loopback,
    }

    impl Read for SlowLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.timeouts > 0 {
                self.timeouts -= 1;
                return Err(std::io::Error::new(ErrorKind::TimedOut, "timed out"));
            }
            self.inner.read(buf)
        }
    }

    impl Write for SlowLink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn slow(timeouts: usize, replies: &str) -> AsciiBus<SlowLink> {
        AsciiBus::new(SlowLink {
            timeouts,
            inner: Loopback::new(replies),
        })
    }

    #[test]
    fn test_late_reply_is_not_taken_for_the_next_one() {
        let mut bus = slow(1, "15.8\n0.25\n");
        assert!(matches!(
            bus.read("vbus_voltage"),
            Err(ControllerError::Timeout { .. })
        ));

        let iq = bus.read("axis0.motor.current_control.Iq_measured").unwrap();
        assert_eq!(iq, 0.25);
        assert_eq!(
            bus.get_ref().inner.sent(),
            "r vbus_voltage\nr axis0.motor.current_control.Iq_measured\n"
        );
    }

    #[test]
    fn test_lost_reply_does_not_block_the_link() {
        // The timed-out reply never shows up; the skip gives up after one wait
        let mut bus = slow(2, "8\n");
        assert!(bus.read("axis1.current_state").is_err());
        assert_eq!(bus.read("axis1.current_state").unwrap(), 8.0);
        assert_eq!(bus.read("vbus_voltage").ok(), None);
    }

    #[test]
    fn test_reply_split_by_timeout_is_kept() {
        let mut bus = AsciiBus::new(Loopback::new("15."));
        assert!(bus.read("vbus_voltage").is_err());
        bus.link.get_mut().replies = Cursor::new(b"84\n1\n".to_vec());
        // "15.84" completes and is skipped as the late reply
        assert_eq!(bus.read("axis0.current_state").unwrap(), 1.0);
    }

    #[test]
    fn test_replies_are_consumed_in_order() {
        let mut bus = AsciiBus::new(Loopback::new("1\n0.25\n"));
        assert_eq!(bus.read("axis0.current_state").unwrap(), 1.0);
        assert_eq!(bus.read("axis0.motor.current_control.Iq_measured").unwrap(), 0.25);
    }
}

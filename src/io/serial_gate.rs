//! Serial link to the gate actuator
//!
//! Protocol:
//! - Baud: configurable (9600 default), 8N1
//! - One ASCII line per command: `<slot_number>:<OPEN|CLOSE>\n`
//! - No response is read

use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{error, info};

/// Boards that reset when the port opens need this long before they listen
pub const RESET_SETTLE: Duration = Duration::from_secs(2);

/// Open the actuator's serial port and wait for the board to come up.
pub async fn open_gate_port(
    device: &str,
    baud: u32,
    settle: Duration,
) -> Result<SerialStream, tokio_serial::Error> {
    let port = tokio_serial::new(device, baud)
        .timeout(Duration::from_millis(100))
        .open_native_async();

    match port {
        Ok(port) => {
            info!(device = %device, baud = %baud, "gate_port_opened");
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            Ok(port)
        }
        Err(e) => {
            error!(device = %device, baud = %baud, error = %e, "gate_port_open_failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let result = open_gate_port("/dev/parkgate-no-such-port", 9600, Duration::ZERO).await;
        assert!(result.is_err());
    }
}

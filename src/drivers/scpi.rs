//! IEEE 488.2 / SCPI helpers shared by SCPI instruments.

use crate::device::Device;
use crate::error::{DeviceError, DeviceResult};
use std::time::Duration;
use tracing::{debug, warn};

/// Event status register bit set by `*OPC` once pending operations finish.
pub const ESR_OPERATION_COMPLETE: u8 = 0x01;

/// Interval between `*ESR?` polls while waiting for completion.
pub const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Most error-queue entries read in one `check_errors` call.
const MAX_ERROR_QUEUE: usize = 32;

/// An entry of the `SYST:ERR?` queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiError {
    /// Error number; 0 means the queue is empty
    pub code: i32,
    /// Instrument's description
    pub message: String,
}

impl ScpiError {
    /// Parse `-113,"Undefined header"`.
    pub fn parse(reply: &str) -> DeviceResult<Self> {
        let (code, message) = reply.split_once(',').unwrap_or((reply, ""));
        let code = code.trim().parse::<i32>().map_err(|_| {
            DeviceError::decode("SYST:ERR", "expected '<code>,\"<message>\"'", reply)
        })?;
        Ok(Self {
            code,
            message: message.trim().trim_matches('"').to_string(),
        })
    }
}

/// Whether an `*ESR?` reply has the operation-complete bit set.
#[must_use]
pub fn operation_complete(reply: &str) -> bool {
    reply
        .trim()
        .trim_start_matches('+')
        .parse::<u16>()
        .is_ok_and(|esr| esr & u16::from(ESR_OPERATION_COMPLETE) != 0)
}

/// Parse an ASCII block of comma-separated numbers, as returned by trace and
/// measurement queries.
pub fn parse_ascii_values(what: &str, reply: &str) -> DeviceResult<Vec<f64>> {
    reply
        .split(',')
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .map_err(|_| DeviceError::decode(what, "expected comma-separated numbers", reply))
        })
        .collect()
}

/// Send each command with `*OPC` appended, then block until the instrument reports
/// completion or `timeout` passes.
///
/// The event status enable register must include bit 0 (`*ESE 1`), which SCPI drivers
/// set when they connect.
pub async fn overlap_and_block(
    device: &mut Device,
    commands: &[&str],
    timeout: Duration,
) -> DeviceResult<()> {
    // Reading *ESR? clears it, so a stale completion bit cannot end the wait early.
    device.query_raw("*ESR?").await?;
    for command in commands {
        debug!(device = %device.id(), command, "overlapped command");
        device.write_raw(&format!("{command};*OPC")).await?;
    }
    device
        .wait_until("*ESR?", operation_complete, timeout, COMPLETION_POLL_INTERVAL)
        .await?;
    Ok(())
}

/// Drain the error queue and fail with the first error found.
pub async fn check_errors(device: &mut Device) -> DeviceResult<()> {
    let mut first: Option<ScpiError> = None;
    for _ in 0..MAX_ERROR_QUEUE {
        let error = ScpiError::parse(&device.query_raw("SYST:ERR?").await?)?;
        if error.code == 0 {
            break;
        }
        warn!(device = %device.id(), code = error.code, message = %error.message, "instrument error");
        first.get_or_insert(error);
    }
    match first {
        Some(error) => Err(DeviceError::command(format!(
            "instrument error {}: {}",
            error.code, error.message
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_entry() {
        let none = ScpiError::parse("+0,\"No error\"").unwrap();
        assert_eq!(none.code, 0);
        assert_eq!(none.message, "No error");

        let err = ScpiError::parse("-113,\"Undefined header\"").unwrap();
        assert_eq!(err.code, -113);
        assert_eq!(err.message, "Undefined header");

        assert!(ScpiError::parse("garbage").is_err());
    }

    #[test]
    fn test_parse_ascii_values() {
        assert_eq!(parse_ascii_values("power", "-10.5").unwrap(), vec![-10.5]);
        assert_eq!(
            parse_ascii_values("trace", " 1.0E+09, 2.5E+09 ").unwrap(),
            vec![1e9, 2.5e9]
        );
        assert!(parse_ascii_values("power", "-10.5,abc").is_err());
    }

    #[test]
    fn test_operation_complete_bit() {
        assert!(operation_complete("1"));
        assert!(operation_complete("+33"));
        assert!(!operation_complete("0"));
        assert!(!operation_complete("32"));
        assert!(!operation_complete(""));
    }
}

//! Native-messaging frames spoken with the host supervisor process.
//!
//! Each frame is a little-endian `u32` byte length followed by a UTF-8 JSON
//! document.  The host answers every command with exactly one frame, in
//! order.

use serde::{Deserialize, Serialize};

/// Upper bound on a single frame; the host never sends anything close.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum SupervisorCommand {
    Start,
    Stop,
    TrayStart,
    TrayStop,
    Status,
}

impl SupervisorCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorCommand::Start => "start",
            SupervisorCommand::Stop => "stop",
            SupervisorCommand::TrayStart => "tray_start",
            SupervisorCommand::TrayStop => "tray_stop",
            SupervisorCommand::Status => "status",
        }
    }
}

/// Acknowledgement for a supervisor command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SupervisorAck {
    pub ok: bool,
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default)]
    pub started: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn encode_frame<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if json.len() > MAX_FRAME_LEN {
        anyhow::bail!("native frame too large: {} bytes", json.len());
    }
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Reads the length header; errors on frames above `MAX_FRAME_LEN`.
pub fn frame_len(header: [u8; 4]) -> anyhow::Result<usize> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("native frame too large: {} bytes", len);
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame_layout() {
        let frame = encode_frame(&SupervisorCommand::TrayStart).unwrap();
        let len = frame_len([frame[0], frame[1], frame[2], frame[3]]).unwrap();
        assert_eq!(len, frame.len() - 4);
        let body: serde_json::Value = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(body["cmd"], "tray_start");
    }

    #[test]
    fn test_ack_tolerates_missing_fields() {
        let ack: SupervisorAck = serde_json::from_str(r#"{"ok":false,"error":"Host did not start"}"#).unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.running, None);
        assert_eq!(ack.error.as_deref(), Some("Host did not start"));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        assert!(frame_len(header).is_err());
    }
}

//! Channel naming.
//!
//! Every published channel follows the `{Gov...}Field` convention,
//! relative to the configured prefix:
//!
//! - `{Gov}`: global scope
//! - `{Gov:NAME}`: one machine
//! - `{Gov:NAME-Dev:KEY}`: one device
//! - `{Gov:NAME-St:KEY}`: one state
//! - `{Gov:NAME-Tr:FROM-TO}`: one transition edge
//!
//! Suffixes: `-Sel` r/w enumeration, `-Cmd` write-only command, `-Sts`
//! r/o status, `-I` r/o informational, `-Pos` r/w number.

use crate::error::PvError;

pub fn gov(prefix: &str) -> String {
    format!("{}{{Gov}}", prefix)
}

pub fn machine(prefix: &str, name: &str) -> String {
    format!("{}{{Gov:{}}}", prefix, name)
}

pub fn device(prefix: &str, name: &str, key: &str) -> String {
    format!("{}{{Gov:{}-Dev:{}}}", prefix, name, key)
}

pub fn state(prefix: &str, name: &str, key: &str) -> String {
    format!("{}{{Gov:{}-St:{}}}", prefix, name, key)
}

pub fn transition(prefix: &str, name: &str, from: &str, to: &str) -> String {
    format!("{}{{Gov:{}-Tr:{}-{}}}", prefix, name, from, to)
}

/// Which end of a hold window a `LLim`/`HLim` write adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitEnd {
    Low,
    High,
}

/// A decoded writable channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAddr {
    /// `{Gov}Active-Sel`
    ActiveSel,
    /// `{Gov}Config-Sel`
    ConfigSel,
    /// `{Gov}Cmd:Abort-Cmd`
    GlobalAbort,
    /// `{Gov}Cmd:Kill-Cmd`
    Kill,
    /// `{Gov:NAME}Cmd:Go-Cmd`
    Go { machine: String },
    /// `{Gov:NAME}Cmd:Abort-Cmd`
    Abort { machine: String },
    /// `{Gov:NAME-Dev:KEY}Pos:TGT-Pos`
    TargetPos {
        machine: String,
        device: String,
        target: String,
    },
    /// `{Gov:NAME-St:KEY}LLim:DEV-Pos` / `HLim:DEV-Pos`
    Window {
        machine: String,
        state: String,
        device: String,
        end: LimitEnd,
    },
}

/// Decodes a written channel name for routing.
pub fn parse_write(prefix: &str, name: &str) -> Result<WriteAddr, PvError> {
    let unknown = || PvError::UnknownChannel {
        channel: name.to_string(),
    };

    let relative = name.strip_prefix(prefix).ok_or_else(unknown)?;
    let body = relative.strip_prefix('{').ok_or_else(unknown)?;
    let (scope, field) = body.split_once('}').ok_or_else(unknown)?;

    // Status and informational suffixes are never writable.
    if field.ends_with("-Sts") || field.ends_with("-I") {
        return Err(PvError::ReadOnly {
            channel: name.to_string(),
        });
    }

    if scope == "Gov" {
        return match field {
            "Active-Sel" => Ok(WriteAddr::ActiveSel),
            "Config-Sel" => Ok(WriteAddr::ConfigSel),
            "Cmd:Abort-Cmd" => Ok(WriteAddr::GlobalAbort),
            "Cmd:Kill-Cmd" => Ok(WriteAddr::Kill),
            _ => Err(unknown()),
        };
    }

    let scoped = scope.strip_prefix("Gov:").ok_or_else(unknown)?;

    if let Some((machine, device)) = scoped.split_once("-Dev:") {
        let target = field
            .strip_prefix("Pos:")
            .and_then(|f| f.strip_suffix("-Pos"))
            .ok_or_else(unknown)?;
        return Ok(WriteAddr::TargetPos {
            machine: machine.to_string(),
            device: device.to_string(),
            target: target.to_string(),
        });
    }

    if let Some((machine, state)) = scoped.split_once("-St:") {
        let (end, rest) = if let Some(rest) = field.strip_prefix("LLim:") {
            (LimitEnd::Low, rest)
        } else if let Some(rest) = field.strip_prefix("HLim:") {
            (LimitEnd::High, rest)
        } else {
            return Err(unknown());
        };
        let device = rest.strip_suffix("-Pos").ok_or_else(unknown)?;
        return Ok(WriteAddr::Window {
            machine: machine.to_string(),
            state: state.to_string(),
            device: device.to_string(),
            end,
        });
    }

    if scoped.contains("-Tr:") {
        // Transition channels are all read-only.
        return Err(PvError::ReadOnly {
            channel: name.to_string(),
        });
    }

    match field {
        "Cmd:Go-Cmd" => Ok(WriteAddr::Go {
            machine: scoped.to_string(),
        }),
        "Cmd:Abort-Cmd" => Ok(WriteAddr::Abort {
            machine: scoped.to_string(),
        }),
        _ => Err(unknown()),
    }
}

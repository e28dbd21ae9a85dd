//! Requestable C-state discovery via the cpuidle sysfs interface.
//!
//! Raw datapoints carry C-state indexes as understood by the OS idle
//! subsystem, but no names. The directory built here maps indexes to
//! requestable C-state names (`POLL`, `C1`, `C6`, ...) for the measured CPU,
//! reading `/sys/devices/system/cpu/cpu<N>/cpuidle/state<I>/`.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// One requestable C-state of a CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStateInfo {
    /// Index as used by the OS idle subsystem.
    pub index: i64,
    /// Requestable C-state name, e.g. `POLL` or `C1E`.
    pub name: String,
    /// Whether the state is disabled on this CPU.
    pub disabled: bool,
}

/// Index → name directory of the requestable C-states of one CPU.
#[derive(Debug, Clone)]
pub struct CStateDirectory {
    cpu: u32,
    states: Vec<CStateInfo>,
}

impl CStateDirectory {
    /// Build the directory from an explicit state list.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoEnabledCStates`] when the list is empty or every
    /// state is disabled: there is nothing to measure on such a CPU.
    pub fn from_states(cpu: u32, states: Vec<CStateInfo>) -> Result<Self> {
        if states.iter().all(|s| s.disabled) {
            return Err(Error::NoEnabledCStates { cpu });
        }
        Ok(Self { cpu, states })
    }

    /// Build the directory for `cpu` from the cpuidle sysfs tree.
    pub fn for_cpu(cpu: u32) -> Result<Self> {
        Self::from_states(cpu, read_cpu_cstates(cpu)?)
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn states(&self) -> &[CStateInfo] {
        &self.states
    }

    /// The name of the C-state with OS index `index`.
    pub fn name_of(&self, index: i64) -> Option<&str> {
        self.states
            .iter()
            .find(|s| s.index == index)
            .map(|s| s.name.as_str())
    }

    /// `index (name)` list of the known indexes, for error messages.
    pub fn known(&self) -> String {
        let mut out = String::new();
        for (i, state) in self.states.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{} ({})", state.index, state.name);
        }
        out
    }
}

fn cpuidle_dir(cpu: u32) -> PathBuf {
    PathBuf::from(format!("/sys/devices/system/cpu/cpu{cpu}/cpuidle"))
}

/// Read the requestable C-states of `cpu` from sysfs.
///
/// # Errors
///
/// Fails when the cpuidle directory is missing (no idle driver in use) or a
/// state attribute cannot be read.
pub fn read_cpu_cstates(cpu: u32) -> Result<Vec<CStateInfo>> {
    let base = cpuidle_dir(cpu);
    if !base.is_dir() {
        return Err(Error::producer(format!(
            "no cpuidle sysfs directory '{}' - no idle driver in use?",
            base.display()
        )));
    }

    let mut states = Vec::new();
    for index in 0.. {
        let state_dir = base.join(format!("state{index}"));
        if !state_dir.is_dir() {
            break;
        }

        let name = read_attr(&state_dir.join("name"))?;
        let disabled = read_attr(&state_dir.join("disable"))? != "0";
        states.push(CStateInfo {
            index,
            name,
            disabled,
        });
    }

    log::debug!("CPU {cpu} requestable C-states: {states:?}");
    Ok(states)
}

fn read_attr(path: &std::path::Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|err| {
            Error::producer(format!("failed to read '{}': {err}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(index: i64, name: &str, disabled: bool) -> CStateInfo {
        CStateInfo {
            index,
            name: name.to_string(),
            disabled,
        }
    }

    #[test]
    fn test_name_resolution() {
        let dir = CStateDirectory::from_states(
            0,
            vec![state(0, "POLL", false), state(1, "C1", false), state(2, "C6", false)],
        )
        .unwrap();

        assert_eq!(dir.name_of(0), Some("POLL"));
        assert_eq!(dir.name_of(2), Some("C6"));
        assert_eq!(dir.name_of(7), None);
        assert_eq!(dir.known(), "0 (POLL), 1 (C1), 2 (C6)");
    }

    #[test]
    fn test_all_disabled_is_refused() {
        let err = CStateDirectory::from_states(
            3,
            vec![state(0, "POLL", true), state(1, "C1", true)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoEnabledCStates { cpu: 3 }));
    }

    #[test]
    fn test_empty_is_refused() {
        assert!(CStateDirectory::from_states(0, Vec::new()).is_err());
    }

    #[test]
    fn test_one_enabled_is_enough() {
        let dir = CStateDirectory::from_states(
            0,
            vec![state(0, "POLL", true), state(1, "C1", false)],
        );
        assert!(dir.is_ok());
    }
}

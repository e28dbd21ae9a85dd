//! C-state interrupt-order classification.
//!
//! Most C-states are requested with local CPU interrupts disabled: when the
//! armed event fires, the CPU first runs the after-idle code and only then
//! jumps to the interrupt handler. Some states (`POLL`, and `C1` on some
//! platforms) are requested with interrupts enabled, in which case the
//! interrupt handler runs first. Latency compensation depends on which order
//! applies, and there is no direct way to ask the hardware - so for the
//! ambiguous states the classifier holds datapoints back and looks at the
//! "interrupt handler vs after-idle" order of the majority.
//!
//! The majority test is a ratio: with `on` votes for "interrupts enabled"
//! and `off` votes against, the ballot settles once
//! `(on + 1) / (off + 1)` (or its inverse) exceeds 100. A settled ballot is
//! terminal; held datapoints for the winning order are released by
//! [`CStateClassifier::drain`] and the losers are discarded.

use std::collections::{BTreeMap, HashMap};

use crate::cpuidle::CStateDirectory;
use crate::datapoint::{self as dp, Datapoint, Value};
use crate::error::{Error, Result};

/// Decision ratio: 100:1 is good enough to conclude the interrupt order.
const BALLOT_RATIO: f64 = 100.0;

/// C-state names whose interrupt order is genuinely ambiguous and must be
/// learned by voting. `C1_ACPI` is the acpi_idle spelling of `C1`.
const AMBIGUOUS_CSNAMES: &[&str] = &["C1", "C1_ACPI"];

/// Held-back datapoints for one C-state while its ballot is open.
#[derive(Debug, Default)]
struct Ballot {
    /// Datapoints voting "entered with interrupts enabled" (`TIntr < TAI`).
    on_queue: Vec<Datapoint>,
    /// Datapoints voting "entered with interrupts disabled".
    off_queue: Vec<Datapoint>,
}

impl Ballot {
    /// The settled order, if the ratio test concludes: `Some(true)` means
    /// interrupts disabled.
    fn verdict(&self) -> Option<bool> {
        let on = self.on_queue.len() as f64;
        let off = self.off_queue.len() as f64;
        if (on + 1.0) / (off + 1.0) > BALLOT_RATIO {
            Some(false)
        } else if (off + 1.0) / (on + 1.0) > BALLOT_RATIO {
            Some(true)
        } else {
            None
        }
    }
}

/// Classifies each raw datapoint's requested C-state and stamps the
/// `IntrOff` flag on it.
#[derive(Debug)]
pub struct CStateClassifier {
    directory: CStateDirectory,
    /// Interrupts are enabled before the C-state is even requested, so no
    /// order needs to be learned.
    early_intr: bool,
    /// Learned interrupt order per ambiguous C-state name.
    decided: HashMap<String, bool>,
    /// Open ballots per ambiguous C-state name.
    ballots: BTreeMap<String, Ballot>,
}

impl CStateClassifier {
    pub fn new(directory: CStateDirectory, early_intr: bool) -> Self {
        Self {
            directory,
            early_intr,
            decided: HashMap::new(),
            ballots: BTreeMap::new(),
        }
    }

    pub fn directory(&self) -> &CStateDirectory {
        &self.directory
    }

    /// Feed a raw datapoint.
    ///
    /// Resolves the `ReqCState` index to a name and attaches the `IntrOff`
    /// flag. Returns `None` while the datapoint is held back by an open
    /// ballot or dropped by the timing sanity gate.
    pub fn feed(&mut self, mut datapoint: Datapoint) -> Result<Option<Datapoint>> {
        let csname = self.resolve_csname(&datapoint)?;
        datapoint.set(dp::REQ_CSTATE, Value::Name(csname.clone()));

        if self.early_intr {
            datapoint.set(dp::INTR_OFF, Value::Bool(false));
            return Ok(Some(datapoint));
        }

        if csname == "POLL" {
            // The POLL state is always requested with interrupts enabled.
            datapoint.set(dp::INTR_OFF, Value::Bool(false));
            return Ok(Some(datapoint));
        }

        if !AMBIGUOUS_CSNAMES.contains(&csname.as_str()) {
            // All C-states deeper than C1 are requested with interrupts
            // disabled.
            datapoint.set(dp::INTR_OFF, Value::Bool(true));
            return Ok(check_timing(datapoint));
        }

        if let Some(&intr_off) = self.decided.get(&csname) {
            datapoint.set(dp::INTR_OFF, Value::Bool(intr_off));
            return Ok(check_timing(datapoint));
        }

        self.vote(&csname, datapoint);
        Ok(None)
    }

    fn resolve_csname(&self, datapoint: &Datapoint) -> Result<String> {
        match datapoint.get(dp::REQ_CSTATE) {
            // Already resolved: the datapoint went through a ballot queue.
            Some(Value::Name(name)) => Ok(name.clone()),
            Some(value) => {
                let index = value.as_int().unwrap_or(-1);
                match self.directory.name_of(index) {
                    Some(name) => Ok(name.to_string()),
                    None => Err(Error::BadCStateIndex {
                        index,
                        known: self.directory.known(),
                        datapoint: datapoint.dump(),
                    }),
                }
            }
            None => Err(Error::Invariant {
                msg: format!(
                    "datapoint without a '{}' field:\n{}",
                    dp::REQ_CSTATE,
                    datapoint.dump()
                ),
            }),
        }
    }

    fn vote(&mut self, csname: &str, datapoint: Datapoint) {
        if !self.ballots.contains_key(csname) {
            log::debug!("figuring out interrupt order for the {csname} requestable C-state");
        }
        let ballot = self.ballots.entry(csname.to_string()).or_default();

        let intr_on =
            datapoint.int(dp::TINTR).unwrap_or(0) < datapoint.int(dp::TAI).unwrap_or(0);
        if intr_on {
            ballot.on_queue.push(datapoint);
        } else {
            ballot.off_queue.push(datapoint);
        }

        if let Some(intr_off) = ballot.verdict() {
            self.decided.insert(csname.to_string(), intr_off);
            log::debug!(
                "figured out interrupt order for {csname}: requested with interrupts {}",
                if intr_off { "disabled" } else { "enabled" }
            );
        }
    }

    /// Release the held datapoints of every settled ballot, in arrival order
    /// within each C-state. Losing-order datapoints are discarded and the
    /// ballot is deleted.
    pub fn drain(&mut self) -> Vec<Datapoint> {
        let mut released = Vec::new();

        let settled: Vec<String> = self
            .ballots
            .keys()
            .filter(|csname| self.decided.contains_key(*csname))
            .cloned()
            .collect();

        for csname in settled {
            let ballot = self.ballots.remove(&csname).unwrap_or_default();
            let intr_off = self.decided[&csname];
            let winners = if intr_off { ballot.off_queue } else { ballot.on_queue };

            for mut datapoint in winners {
                datapoint.set(dp::INTR_OFF, Value::Bool(intr_off));
                if let Some(datapoint) = check_timing(datapoint) {
                    released.push(datapoint);
                }
            }
        }

        released
    }
}

/// Timing sanity gate: drops datapoints whose handler bracket ordering
/// contradicts the interrupt order about to be attached.
fn check_timing(datapoint: Datapoint) -> Option<Datapoint> {
    let intr_off = datapoint.get(dp::INTR_OFF).and_then(Value::as_bool)?;

    if intr_off {
        if datapoint.int(dp::AITS2) > datapoint.int(dp::INTR_TS1) {
            log::debug!(
                "'AITS2' > 'IntrTS1', even though interrupts were disabled.\n\
                 Dropping the following datapoint\n{}",
                datapoint.dump()
            );
            return None;
        }
    } else if datapoint.int(dp::INTR_TS2) > datapoint.int(dp::AITS1) {
        log::debug!(
            "'IntrTS2' > 'AITS1', even though interrupts were enabled.\n\
             Dropping the following datapoint\n{}",
            datapoint.dump()
        );
        return None;
    }

    Some(datapoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuidle::CStateInfo;

    fn directory() -> CStateDirectory {
        let states = vec![
            CStateInfo { index: 0, name: "POLL".into(), disabled: false },
            CStateInfo { index: 1, name: "C1".into(), disabled: false },
            CStateInfo { index: 2, name: "C1E".into(), disabled: false },
            CStateInfo { index: 3, name: "C6".into(), disabled: false },
        ];
        CStateDirectory::from_states(0, states).unwrap()
    }

    /// A datapoint with consistent interrupts-disabled bracket timing
    /// (`TAI < TIntr`, `AITS2 <= IntrTS1`).
    fn intr_off_dp(index: i64) -> Datapoint {
        let mut datapoint = Datapoint::new();
        datapoint.set(dp::REQ_CSTATE, Value::Int(index));
        datapoint.set(dp::TAI, Value::Int(2_000));
        datapoint.set(dp::TINTR, Value::Int(3_000));
        datapoint.set(dp::AITS1, Value::Int(2_010));
        datapoint.set(dp::AITS2, Value::Int(2_050));
        datapoint.set(dp::INTR_TS1, Value::Int(2_990));
        datapoint.set(dp::INTR_TS2, Value::Int(3_010));
        datapoint
    }

    /// A datapoint with consistent interrupts-enabled bracket timing
    /// (`TIntr < TAI`, `IntrTS2 <= AITS1`).
    fn intr_on_dp(index: i64) -> Datapoint {
        let mut datapoint = Datapoint::new();
        datapoint.set(dp::REQ_CSTATE, Value::Int(index));
        datapoint.set(dp::TAI, Value::Int(3_000));
        datapoint.set(dp::TINTR, Value::Int(2_000));
        datapoint.set(dp::AITS1, Value::Int(3_010));
        datapoint.set(dp::AITS2, Value::Int(3_050));
        datapoint.set(dp::INTR_TS1, Value::Int(1_990));
        datapoint.set(dp::INTR_TS2, Value::Int(2_010));
        datapoint
    }

    fn intr_off_of(datapoint: &Datapoint) -> bool {
        datapoint.get(dp::INTR_OFF).and_then(Value::as_bool).unwrap()
    }

    #[test]
    fn test_poll_is_interrupts_enabled() {
        let mut clf = CStateClassifier::new(directory(), false);
        let out = clf.feed(intr_on_dp(0)).unwrap().unwrap();
        assert_eq!(out.get(dp::REQ_CSTATE), Some(&Value::Name("POLL".into())));
        assert!(!intr_off_of(&out));
    }

    #[test]
    fn test_deeper_than_c1_skips_voting() {
        let mut clf = CStateClassifier::new(directory(), false);
        let out = clf.feed(intr_off_dp(3)).unwrap().unwrap();
        assert_eq!(out.get(dp::REQ_CSTATE), Some(&Value::Name("C6".into())));
        assert!(intr_off_of(&out));
        // C1E is not ambiguous either.
        let out = clf.feed(intr_off_dp(2)).unwrap().unwrap();
        assert!(intr_off_of(&out));
    }

    #[test]
    fn test_bad_index() {
        let mut clf = CStateClassifier::new(directory(), false);
        let err = clf.feed(intr_on_dp(9)).unwrap_err();
        assert!(matches!(err, Error::BadCStateIndex { index: 9, .. }));
    }

    #[test]
    fn test_early_intr_short_circuits() {
        let mut clf = CStateClassifier::new(directory(), true);
        // Even a deep C-state is stamped interrupts-enabled.
        let out = clf.feed(intr_off_dp(3)).unwrap().unwrap();
        assert!(!intr_off_of(&out));
        // And C1 does not vote.
        let out = clf.feed(intr_on_dp(1)).unwrap().unwrap();
        assert!(!intr_off_of(&out));
    }

    #[test]
    fn test_timing_gate_drops_contradictions() {
        let mut clf = CStateClassifier::new(directory(), false);

        // Interrupts disabled, but the after-idle bracket closed after the
        // interrupt bracket opened.
        let mut bad = intr_off_dp(3);
        bad.set(dp::AITS2, Value::Int(5_000));
        assert!(clf.feed(bad).unwrap().is_none());

        // A consistent C6 datapoint still passes.
        assert!(clf.feed(intr_off_dp(3)).unwrap().is_some());

        // Settle C1 as interrupts-enabled, then feed a C1 datapoint whose
        // interrupt bracket closed after the after-idle bracket opened.
        for _ in 0..205 {
            clf.feed(intr_on_dp(1)).unwrap();
        }
        clf.drain();
        let mut bad = intr_on_dp(1);
        bad.set(dp::INTR_TS2, Value::Int(9_000));
        assert!(clf.feed(bad).unwrap().is_none());
    }

    #[test]
    fn test_c1_ballot_majority() {
        let mut clf = CStateClassifier::new(directory(), false);

        // 101 "on" votes and 1 "off" vote: ratio 102/2 = 51, still held.
        for _ in 0..101 {
            assert!(clf.feed(intr_on_dp(1)).unwrap().is_none());
        }
        assert!(clf.feed(intr_off_dp(1)).unwrap().is_none());
        assert!(clf.drain().is_empty());

        // One more "on": 103/2 = 51.5, still held.
        assert!(clf.feed(intr_on_dp(1)).unwrap().is_none());
        assert!(clf.drain().is_empty());

        // Keep voting "on". The ballot settles at 200 "on" votes, when
        // (200 + 1) / (1 + 1) crosses the 100 threshold; later datapoints
        // flow straight through.
        let mut held = 0;
        let mut passed = 0;
        for _ in 0..100 {
            match clf.feed(intr_on_dp(1)).unwrap() {
                Some(out) => {
                    assert!(!intr_off_of(&out));
                    passed += 1;
                }
                None => held += 1,
            }
        }
        assert_eq!(held, 98);
        assert_eq!(passed, 2);

        let released = clf.drain();
        // All 200 held "on" datapoints; the losing "off" one is discarded.
        assert_eq!(released.len(), 200);
        assert!(released.iter().all(|d| !intr_off_of(d)));
        assert!(
            released
                .iter()
                .all(|d| d.get(dp::REQ_CSTATE) == Some(&Value::Name("C1".into())))
        );

        // The ballot is gone; drain is idempotent.
        assert!(clf.drain().is_empty());

        // Once settled, C1 datapoints flow straight through.
        let out = clf.feed(intr_on_dp(1)).unwrap().unwrap();
        assert!(!intr_off_of(&out));
    }

    #[test]
    fn test_settled_classifier_is_idempotent() {
        let mut clf = CStateClassifier::new(directory(), false);
        for _ in 0..202 {
            clf.feed(intr_on_dp(1)).unwrap();
        }
        clf.drain();

        let once = clf.feed(intr_on_dp(1)).unwrap().unwrap();
        let twice = clf.feed(intr_on_dp(1)).unwrap().unwrap();
        assert_eq!(once.get(dp::INTR_OFF), twice.get(dp::INTR_OFF));
        assert_eq!(once.get(dp::REQ_CSTATE), twice.get(dp::REQ_CSTATE));
    }

    #[test]
    fn test_ballot_votes_match_queue_sizes() {
        let mut clf = CStateClassifier::new(directory(), false);
        for _ in 0..5 {
            clf.feed(intr_on_dp(1)).unwrap();
        }
        for _ in 0..3 {
            clf.feed(intr_off_dp(1)).unwrap();
        }
        let ballot = &clf.ballots["C1"];
        assert_eq!(ballot.on_queue.len(), 5);
        assert_eq!(ballot.off_queue.len(), 3);
        assert_eq!(ballot.verdict(), None);
    }
}

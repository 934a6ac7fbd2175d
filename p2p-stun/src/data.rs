use crate::attributes::*;
use crate::message::*;
use shared::error::*;

/// Cookie that relay servers expect as the first attribute of every request.
pub const DEFAULT_MAGIC_COOKIE: [u8; 4] = [0x72, 0xc6, 0x4b, 0xc6];

/// Offset of the first attribute value: header plus one attribute header.
const MAGIC_COOKIE_OFFSET: usize = MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE;

/// Data represents DATA attribute.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

impl Setter for Data {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(ATTR_DATA, &self.0)
    }
}

impl Getter for Data {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        self.0 = m.get(ATTR_DATA)?.to_vec();
        Ok(())
    }
}

/// MagicCookie represents MAGIC-COOKIE attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicCookie(pub Vec<u8>);

impl Default for MagicCookie {
    fn default() -> Self {
        MagicCookie(DEFAULT_MAGIC_COOKIE.to_vec())
    }
}

impl Setter for MagicCookie {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(ATTR_MAGIC_COOKIE, &self.0)
    }
}

impl Getter for MagicCookie {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        self.0 = m.get(ATTR_MAGIC_COOKIE)?.to_vec();
        Ok(())
    }
}

/// has_magic_cookie reports whether a raw packet carries `cookie` as the value
/// of its first attribute, which tells relay traffic apart from raw payload.
pub fn has_magic_cookie(data: &[u8], cookie: &[u8]) -> bool {
    data.len() >= MAGIC_COOKIE_OFFSET + cookie.len()
        && &data[MAGIC_COOKIE_OFFSET..MAGIC_COOKIE_OFFSET + cookie.len()] == cookie
}

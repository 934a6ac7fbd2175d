use std::fmt;

use crate::attributes::*;
use crate::message::*;
use shared::error::*;

/// Username represents USERNAME attribute.
pub type Username = TextAttribute;

/// Password represents PASSWORD attribute.
pub type Password = TextAttribute;

/// TextAttribute is helper for adding and getting text attributes.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct TextAttribute {
    pub attr: AttrType,
    pub text: String,
}

impl fmt::Display for TextAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl Setter for TextAttribute {
    /// add_to adds the text as attribute of type attr.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(self.attr, self.text.as_bytes())
    }
}

impl Getter for TextAttribute {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let attr = self.attr;
        *self = TextAttribute::get_from_as(m, attr)?;
        Ok(())
    }
}

impl TextAttribute {
    pub fn new(attr: AttrType, text: String) -> Self {
        TextAttribute { attr, text }
    }

    /// get_from_as reads attribute attr from m as UTF-8 text.
    pub fn get_from_as(m: &Message, attr: AttrType) -> Result<Self> {
        let a = m.get(attr)?;
        let text = String::from_utf8(a.to_vec())?;
        Ok(TextAttribute { attr, text })
    }
}

#[cfg(test)]
mod binding_test;

use log::warn;
use std::net::SocketAddr;

use shared::error::*;
use stun::addr::MappedAddress;
use stun::attributes::{ATTR_ERROR_CODE, ATTR_USERNAME};
use stun::error_code::ErrorCode;
use stun::message::*;
use stun::textattrs::Username;

/// Outcome of inspecting an inbound packet on a port.
#[derive(Debug)]
pub(crate) enum BindingInput {
    /// The packet is not STUN; it is application data.
    Data,
    /// A STUN message that was rejected; `reply` must be sent back to the
    /// source when present.
    Handled { reply: Option<Message> },
    /// An authenticated message along with the peer's part of its USERNAME.
    Message {
        msg: Message,
        remote_username: String,
    },
}

/// Parses `data` as STUN and authenticates its USERNAME against the local
/// fragment: requests must start with it, answers must end with it.
pub(crate) fn parse_binding_message(name: &str, data: &[u8], local_ufrag: &str) -> BindingInput {
    let msg = match Message::unmarshal(data) {
        Ok(msg) => msg,
        Err(_) => return BindingInput::Data,
    };
    let username = Username::get_from_as(&msg, ATTR_USERNAME)
        .ok()
        .map(|username| username.text);

    match msg.typ {
        BINDING_REQUEST => match username {
            Some(username) if username.starts_with(local_ufrag) => BindingInput::Message {
                remote_username: username[local_ufrag.len()..].to_owned(),
                msg,
            },
            Some(username) => {
                warn!(
                    "[{}]: received {} with bad username {}",
                    name, msg.typ, username
                );
                BindingInput::Handled {
                    reply: binding_error_response(&msg, stun::error_code::CODE_BAD_REQUEST).ok(),
                }
            }
            None => {
                warn!("[{}]: received {} without username", name, msg.typ);
                BindingInput::Handled { reply: None }
            }
        },
        BINDING_RESPONSE | BINDING_ERROR_RESPONSE => match username {
            Some(username)
                if username.len() >= local_ufrag.len() && username.ends_with(local_ufrag) =>
            {
                if msg.typ == BINDING_ERROR_RESPONSE && !msg.contains(ATTR_ERROR_CODE) {
                    warn!("[{}]: received {} without error code", name, msg.typ);
                    return BindingInput::Handled { reply: None };
                }
                BindingInput::Message {
                    remote_username: username[..username.len() - local_ufrag.len()].to_owned(),
                    msg,
                }
            }
            _ => {
                warn!(
                    "[{}]: received {} with bad username {:?}",
                    name, msg.typ, username
                );
                BindingInput::Handled { reply: None }
            }
        },
        _ => {
            warn!("[{}]: received STUN packet with invalid type {}", name, msg.typ);
            BindingInput::Handled { reply: None }
        }
    }
}

/// Answers a binding request, echoing its USERNAME and reporting `addr` as
/// MAPPED-ADDRESS.
pub(crate) fn binding_response(request: &Message, addr: SocketAddr) -> Result<Message> {
    let mut response = Message::new(BINDING_RESPONSE);
    response.transaction_id = request.transaction_id;
    if let Ok(username) = request.get(ATTR_USERNAME) {
        response.add(ATTR_USERNAME, username)?;
    }
    MappedAddress::try_from(addr)?.add_to(&mut response)?;
    Ok(response)
}

/// Rejects a binding request with `code`, echoing its USERNAME.
pub(crate) fn binding_error_response(request: &Message, code: ErrorCode) -> Result<Message> {
    let mut response = Message::new(BINDING_ERROR_RESPONSE);
    response.transaction_id = request.transaction_id;
    if let Ok(username) = request.get(ATTR_USERNAME) {
        response.add(ATTR_USERNAME, username)?;
    }
    code.add_to(&mut response)?;
    Ok(response)
}

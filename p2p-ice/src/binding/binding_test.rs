use super::*;
use stun::attributes::ATTR_MAPPED_ADDRESS;
use stun::error_code::*;

const UFRAG: &str = "localfragment000";

fn request_with_username(username: Option<&str>) -> Result<Vec<u8>> {
    let mut m = Message::new(BINDING_REQUEST);
    if let Some(username) = username {
        Username::new(ATTR_USERNAME, username.to_owned()).add_to(&mut m)?;
    }
    m.marshal()
}

#[test]
fn test_parse_non_stun() {
    assert!(matches!(
        parse_binding_message("test", b"hello world", UFRAG),
        BindingInput::Data
    ));
}

#[test]
fn test_parse_request_prefix() -> Result<()> {
    let raw = request_with_username(Some("localfragment000remotefragment00"))?;
    match parse_binding_message("test", &raw, UFRAG) {
        BindingInput::Message {
            msg,
            remote_username,
        } => {
            assert_eq!(msg.typ, BINDING_REQUEST);
            assert_eq!(remote_username, "remotefragment00");
        }
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[test]
fn test_parse_request_bad_username_replies_400() -> Result<()> {
    let raw = request_with_username(Some("remotefragment00localfragment000"))?;
    match parse_binding_message("test", &raw, UFRAG) {
        BindingInput::Handled { reply: Some(reply) } => {
            assert_eq!(reply.typ, BINDING_ERROR_RESPONSE);
            let mut code = ErrorCodeAttribute::default();
            code.get_from(&reply)?;
            assert_eq!(code.code, CODE_BAD_REQUEST);
            assert_eq!(code.reason, b"BAD REQUEST");
            let username = Username::get_from_as(&reply, ATTR_USERNAME)?;
            assert_eq!(username.text, "remotefragment00localfragment000");
        }
        other => panic!("unexpected {other:?}"),
    }

    // no username at all: dropped without answer
    let raw = request_with_username(None)?;
    assert!(matches!(
        parse_binding_message("test", &raw, UFRAG),
        BindingInput::Handled { reply: None }
    ));
    Ok(())
}

#[test]
fn test_parse_response_suffix() -> Result<()> {
    let mut m = Message::new(BINDING_RESPONSE);
    Username::new(ATTR_USERNAME, "remotefragment00localfragment000".to_owned())
        .add_to(&mut m)?;
    match parse_binding_message("test", &m.marshal()?, UFRAG) {
        BindingInput::Message {
            remote_username, ..
        } => assert_eq!(remote_username, "remotefragment00"),
        other => panic!("unexpected {other:?}"),
    }

    let mut m = Message::new(BINDING_RESPONSE);
    Username::new(ATTR_USERNAME, "localfragment000remotefragment00".to_owned())
        .add_to(&mut m)?;
    assert!(matches!(
        parse_binding_message("test", &m.marshal()?, UFRAG),
        BindingInput::Handled { reply: None }
    ));

    // an error response must carry an error code
    let mut m = Message::new(BINDING_ERROR_RESPONSE);
    Username::new(ATTR_USERNAME, "remotefragment00localfragment000".to_owned())
        .add_to(&mut m)?;
    assert!(matches!(
        parse_binding_message("test", &m.marshal()?, UFRAG),
        BindingInput::Handled { reply: None }
    ));
    Ok(())
}

#[test]
fn test_binding_response_maps_source() -> Result<()> {
    let raw = request_with_username(Some("localfragment000remotefragment00"))?;
    let request = Message::unmarshal(&raw)?;
    let source: SocketAddr = "198.51.100.7:6000".parse()?;
    let response = binding_response(&request, source)?;

    assert_eq!(response.typ, BINDING_RESPONSE);
    assert_eq!(response.transaction_id, request.transaction_id);
    assert!(response.contains(ATTR_MAPPED_ADDRESS));
    let mut mapped = MappedAddress::default();
    mapped.get_from(&response)?;
    assert_eq!(mapped.socket_addr(), source);
    Ok(())
}

use std::net::{Ipv4Addr, SocketAddr};

use crate::addr::*;
use crate::attributes::*;
use crate::data::*;
use crate::error_code::*;
use crate::message::*;
use crate::options::*;
use crate::textattrs::*;
use shared::error::*;

#[test]
fn test_message_header_layout() -> Result<()> {
    let mut m = Message::new(BINDING_REQUEST);
    m.transaction_id = TransactionId([7u8; TRANSACTION_ID_SIZE]);
    Username::new(ATTR_USERNAME, "abcdefgh".to_owned()).add_to(&mut m)?;

    let raw = m.marshal()?;
    assert_eq!(raw.len(), MESSAGE_HEADER_SIZE + 4 + 8);
    assert_eq!(&raw[0..2], &[0x00, 0x01]);
    assert_eq!(&raw[2..4], &[0x00, 12]);
    assert_eq!(&raw[4..20], &[7u8; 16]);
    assert_eq!(&raw[20..24], &[0x00, 0x06, 0x00, 0x08]);
    assert_eq!(&raw[24..], b"abcdefgh");

    let decoded = Message::unmarshal(&raw)?;
    assert_eq!(decoded, m);
    Ok(())
}

#[test]
fn test_message_data_padding() -> Result<()> {
    let mut m = Message::new(SEND_REQUEST);
    MagicCookie::default().add_to(&mut m)?;
    Data(b"hello".to_vec()).add_to(&mut m)?;

    let raw = m.marshal()?;
    // cookie (4 + 4) + data (4 + 5 padded to 8)
    assert_eq!(m.length(), 20);
    assert_eq!(raw.len(), MESSAGE_HEADER_SIZE + 20);
    // declared length stays the real one
    assert_eq!(&raw[28..32], &[0x00, 0x13, 0x00, 0x05]);
    assert_eq!(&raw[37..40], &[0, 0, 0]);
    assert!(has_magic_cookie(&raw, &DEFAULT_MAGIC_COOKIE));

    let decoded = Message::unmarshal(&raw)?;
    let mut data = Data::default();
    data.get_from(&decoded)?;
    assert_eq!(data.0, b"hello");
    Ok(())
}

#[test]
fn test_message_rejects_trailing_and_truncated() -> Result<()> {
    let mut m = Message::new(BINDING_RESPONSE);
    MappedAddress {
        ip: Ipv4Addr::new(10, 0, 0, 1),
        port: 5000,
    }
    .add_to(&mut m)?;
    let raw = m.marshal()?;

    let mut trailing = raw.clone();
    trailing.push(0);
    assert_eq!(Message::unmarshal(&trailing), Err(Error::ErrTrailingBytes));

    assert_eq!(
        Message::unmarshal(&raw[..raw.len() - 1]),
        Err(Error::ErrUnexpectedEndOfBuffer {
            expected: 12,
            actual: 11
        })
    );
    assert_eq!(
        Message::unmarshal(&raw[..10]),
        Err(Error::ErrUnexpectedHeaderEof)
    );
    Ok(())
}

#[test]
fn test_message_rejects_bad_attribute_sizes() -> Result<()> {
    let mut m = Message::new(BINDING_RESPONSE);
    m.add(ATTR_MAPPED_ADDRESS, &[0, 1, 0, 80])?;
    assert_eq!(
        Message::unmarshal(&m.marshal()?),
        Err(Error::ErrAttributeSizeInvalid)
    );

    let mut m = Message::new(BINDING_REQUEST);
    m.add(ATTR_USERNAME, b"abc")?;
    assert_eq!(
        Message::unmarshal(&m.marshal()?),
        Err(Error::ErrAttributeSizeInvalid)
    );

    let mut m = Message::new(BINDING_REQUEST);
    m.add(AttrType(0x0042), &[0, 0, 0, 0])?;
    assert_eq!(
        Message::unmarshal(&m.marshal()?),
        Err(Error::ErrUnknownAttributeType(0x0042))
    );
    Ok(())
}

#[test]
fn test_address_attributes() -> Result<()> {
    let addr: SocketAddr = "192.168.1.20:3478".parse()?;
    let mut m = Message::new(SEND_REQUEST);
    MappedAddress::try_from(addr)?.add_to_as(&mut m, ATTR_DESTINATION_ADDRESS)?;

    let decoded = Message::unmarshal(&m.marshal()?)?;
    let mut got = MappedAddress::default();
    assert_eq!(got.get_from(&decoded), Err(Error::ErrAttributeNotFound));
    got.get_from_as(&decoded, ATTR_DESTINATION_ADDRESS)?;
    assert_eq!(got.socket_addr(), addr);

    let v6: SocketAddr = "[::1]:3478".parse()?;
    assert_eq!(
        MappedAddress::try_from(v6),
        Err(Error::ErrBadAddressFamily)
    );

    let mut m = Message::new(DATA_INDICATION);
    m.add(ATTR_SOURCE_ADDRESS2, &[0, 2, 0, 80, 1, 2, 3, 4])?;
    let decoded = Message::unmarshal(&m.marshal()?)?;
    assert_eq!(
        got.get_from_as(&decoded, ATTR_SOURCE_ADDRESS2),
        Err(Error::ErrBadAddressFamily)
    );
    Ok(())
}

#[test]
fn test_error_code_attribute() -> Result<()> {
    let mut m = Message::new(BINDING_ERROR_RESPONSE);
    CODE_STALE_CREDENTIALS.add_to(&mut m)?;
    let raw = m.marshal()?;
    assert_eq!(&raw[24..28], &[0, 0, 4, 30]);

    let decoded = Message::unmarshal(&raw)?;
    let mut attr = ErrorCodeAttribute::default();
    attr.get_from(&decoded)?;
    assert_eq!(attr.code, CODE_STALE_CREDENTIALS);
    assert_eq!(attr.reason, b"STALE CREDENTIALS");
    assert_eq!(attr.to_string(), "430: STALE CREDENTIALS");
    Ok(())
}

#[test]
fn test_options_and_types() -> Result<()> {
    let mut m = Message::new(SEND_RESPONSE);
    Options(OPTION_LOCKED).add_to(&mut m)?;
    let decoded = Message::unmarshal(&m.marshal()?)?;
    let mut options = Options::default();
    options.get_from(&decoded)?;
    assert!(options.is_locked());

    assert_eq!(ALLOCATE_REQUEST.response_type(), ALLOCATE_RESPONSE);
    assert_eq!(SEND_REQUEST.error_response_type(), SEND_ERROR_RESPONSE);
    assert_eq!(BINDING_REQUEST.response_type(), BINDING_RESPONSE);
    assert!(BINDING_REQUEST.is_request());
    assert!(BINDING_RESPONSE.is_response());
    assert!(!BINDING_ERROR_RESPONSE.is_response());
    assert!(BINDING_ERROR_RESPONSE.is_error_response());
    assert!(!DATA_INDICATION.is_error_response());
    assert_eq!(DATA_INDICATION.to_string(), "data indication");
    Ok(())
}

#[test]
fn test_message_build() -> Result<()> {
    let id = TransactionId::new();
    let mut m = Message::default();
    m.build(&[
        Box::new(ALLOCATE_REQUEST),
        Box::new(id),
        Box::new(MagicCookie::default()),
        Box::new(Username::new(ATTR_USERNAME, "0123456789abcdef".to_owned())),
    ])?;

    assert_eq!(m.typ, ALLOCATE_REQUEST);
    assert_eq!(m.transaction_id, id);
    let username = Username::get_from_as(&m, ATTR_USERNAME)?;
    assert_eq!(username.text, "0123456789abcdef");
    assert!(m.contains(ATTR_MAGIC_COOKIE));
    Ok(())
}

use std::time::{Duration, Instant};

use crate::error_code::*;
use crate::message::*;
use crate::request::*;
use shared::error::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Binding,
    Allocate,
}

fn answer(request: &Message, typ: MessageType) -> Message {
    let mut response = Message::new(typ);
    response.transaction_id = request.transaction_id;
    response
}

#[test]
fn test_request_backoff_schedule() -> Result<()> {
    //env_logger::init();

    let start = Instant::now();
    let mut manager = StunRequestManager::new("test".to_owned());
    let id = manager.send(Kind::Binding, Message::new(BINDING_REQUEST), start)?;
    assert!(manager.poll_transmit().is_some());
    assert_eq!(manager.get(&id).map(|r| r.count()), Some(1));

    let mut now = start;
    let mut send_times = vec![];
    while let Some(deadline) = manager.poll_timeout() {
        now = deadline;
        manager.handle_timeout(now);
        while manager.poll_transmit().is_some() {
            send_times.push(now.duration_since(start));
        }
    }

    let expected: Vec<Duration> = [100u64, 300, 700, 1500, 3100, 4700, 6300, 7900]
        .iter()
        .map(|ms| Duration::from_millis(*ms))
        .collect();
    assert_eq!(send_times, expected);
    assert_eq!(now.duration_since(start), Duration::from_millis(9500));

    match manager.poll_event() {
        Some(StunRequestEvent::Timeout { kind, request }) => {
            assert_eq!(kind, Kind::Binding);
            assert_eq!(request.transaction_id, id);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(manager.is_empty());
    Ok(())
}

#[test]
fn test_request_response_dispatch() -> Result<()> {
    let now = Instant::now();
    let mut manager = StunRequestManager::new("test".to_owned());
    let id = manager.send(Kind::Allocate, Message::new(ALLOCATE_REQUEST), now)?;
    let request = manager.get(&id).map(|r| r.msg().clone()).ok_or(Error::ErrTransactionNotExists)?;

    // a known id with the wrong type is ignored and stays outstanding
    assert!(!manager.check_response(&answer(&request, BINDING_RESPONSE), now));
    assert!(manager.contains(&id));

    let later = now + Duration::from_millis(40);
    assert!(manager.check_response(&answer(&request, ALLOCATE_RESPONSE), later));
    assert!(!manager.contains(&id));
    match manager.poll_event() {
        Some(StunRequestEvent::Response { kind, rtt, .. }) => {
            assert_eq!(kind, Kind::Allocate);
            assert_eq!(rtt, Duration::from_millis(40));
        }
        other => panic!("expected response, got {other:?}"),
    }

    // a second answer finds nothing
    assert!(!manager.check_response(&answer(&request, ALLOCATE_RESPONSE), later));
    assert!(manager.poll_event().is_none());
    assert_eq!(manager.poll_timeout(), None);
    Ok(())
}

#[test]
fn test_request_error_response() -> Result<()> {
    let now = Instant::now();
    let mut manager = StunRequestManager::new("test".to_owned());
    let id = manager.send(Kind::Binding, Message::new(BINDING_REQUEST), now)?;
    let request = manager.get(&id).map(|r| r.msg().clone()).ok_or(Error::ErrTransactionNotExists)?;

    let mut response = answer(&request, BINDING_ERROR_RESPONSE);
    CODE_UNAUTHORIZED.add_to(&mut response)?;
    assert!(manager.check_response(&response, now));

    match manager.poll_event() {
        Some(StunRequestEvent::ErrorResponse { response, .. }) => {
            let mut code = ErrorCodeAttribute::default();
            code.get_from(&response)?;
            assert_eq!(code.code, CODE_UNAUTHORIZED);
        }
        other => panic!("expected error response, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_request_delayed_and_clear() -> Result<()> {
    let now = Instant::now();
    let mut manager = StunRequestManager::new("test".to_owned());
    let first = manager.send_delayed(
        Kind::Binding,
        Message::new(BINDING_REQUEST),
        Duration::from_secs(10),
        now,
    )?;
    let second = manager.send(Kind::Binding, Message::new(BINDING_REQUEST), now)?;
    assert_ne!(first, second);

    // only the immediate request went out
    assert!(manager.poll_transmit().is_some());
    assert!(manager.poll_transmit().is_none());
    assert_eq!(manager.get(&first).map(|r| r.count()), Some(0));

    manager.handle_timeout(now + Duration::from_secs(10));
    assert_eq!(manager.get(&first).map(|r| r.count()), Some(1));

    manager.clear();
    assert!(manager.is_empty());
    assert_eq!(manager.poll_timeout(), None);
    manager.handle_timeout(now + Duration::from_secs(60));
    assert!(manager.poll_event().is_none());
    Ok(())
}

#[test]
fn test_request_send_once() -> Result<()> {
    let now = Instant::now();
    let mut manager = StunRequestManager::new("test".to_owned());
    manager.send_with(
        Kind::Binding,
        Message::new(BINDING_REQUEST),
        Retransmit::Once(Duration::from_secs(5)),
        Duration::ZERO,
        now,
    )?;
    assert!(manager.poll_transmit().is_some());
    assert_eq!(manager.poll_timeout(), Some(now + Duration::from_secs(5)));

    manager.handle_timeout(now + Duration::from_secs(5));
    assert!(manager.poll_transmit().is_none());
    assert!(matches!(
        manager.poll_event(),
        Some(StunRequestEvent::Timeout { .. })
    ));
    Ok(())
}

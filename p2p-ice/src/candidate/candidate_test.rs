use super::*;

fn candidate_config() -> CandidateConfig {
    CandidateConfig {
        name: "rtp".to_owned(),
        candidate_type: CandidateType::Stun,
        protocol: ProtocolType::Udp,
        address: "203.0.113.9:40123".parse().unwrap(),
        preference: 0.9,
        username: "aB3+/xyz0123QWER".to_owned(),
        password: "p@ss word&=".to_owned(),
        network_name: "Local Area Connection 2".to_owned(),
        generation: 3,
    }
}

#[test]
fn test_candidate_round_trip() -> Result<()> {
    let candidates = vec![
        Candidate::from(candidate_config()),
        Candidate::from(CandidateConfig {
            candidate_type: CandidateType::Relay,
            protocol: ProtocolType::SslTcp,
            address: "[2001:db8::1]:443".parse()?,
            preference: -0.2,
            password: String::new(),
            network_name: String::new(),
            ..candidate_config()
        }),
        Candidate::from(CandidateConfig {
            preference: 1.0,
            generation: 0,
            ..candidate_config()
        }),
    ];

    for c in candidates {
        let raw = c.marshal();
        let parsed = unmarshal_candidate(&raw)?;
        assert_eq!(parsed, c, "{raw}");
        assert!(parsed.is_equivalent(&c));
    }
    Ok(())
}

#[test]
fn test_candidate_optional_attributes() -> Result<()> {
    let c = unmarshal_candidate(
        "name=rtp&address=198.51.100.4&port=5000&username=abcd&preference=1&protocol=tcp&generation=0&extra=1",
    )?;
    assert_eq!(c.candidate_type(), CandidateType::Local);
    assert_eq!(c.protocol(), ProtocolType::Tcp);
    assert_eq!(c.password(), "");
    assert_eq!(c.network_name(), "");
    assert_eq!(c.address(), "198.51.100.4:5000".parse::<SocketAddr>()?);
    Ok(())
}

#[test]
fn test_candidate_missing_or_bad_attributes() {
    let raw = Candidate::from(candidate_config()).marshal();
    let without_port: String = raw
        .split('&')
        .filter(|kv| !kv.starts_with("port="))
        .collect::<Vec<_>>()
        .join("&");
    assert_eq!(
        unmarshal_candidate(&without_port),
        Err(Error::ErrCandidateMissingAttribute("port".to_owned()))
    );

    let bad_protocol = raw.replace("protocol=udp", "protocol=sctp");
    assert_eq!(
        unmarshal_candidate(&bad_protocol),
        Err(Error::ErrUnknownProtocolType)
    );

    let bad_type = raw.replace("type=stun", "type=prflx");
    assert_eq!(
        unmarshal_candidate(&bad_type),
        Err(Error::ErrUnknownCandidateType)
    );
}

#[test]
fn test_candidate_validate_remote() -> Result<()> {
    assert_eq!(Candidate::from(candidate_config()).validate_remote(), Ok(()));

    let tests: Vec<(&str, &str, Result<()>)> = vec![
        ("0.0.0.0:5000", "abcd", Err(Error::ErrCandidateUnspecifiedAddress)),
        ("127.0.0.1:5000", "abcd", Err(Error::ErrCandidateLocalAddress)),
        ("203.0.113.9:22", "abcd", Err(Error::ErrCandidateRestrictedPort)),
        ("203.0.113.9:443", "abcd", Ok(())),
        ("192.168.1.5:443", "abcd", Err(Error::ErrCandidateRestrictedPort)),
        ("192.168.1.5:5000", "abcd", Ok(())),
        (
            "203.0.113.9:5000",
            "0123456789abcdefg",
            Err(Error::ErrCandidateUsernameTooLong),
        ),
        ("203.0.113.9:5000", "ab-cd", Err(Error::ErrCandidateUsernameInvalid)),
    ];

    for (address, username, expected) in tests {
        let c = Candidate::from(CandidateConfig {
            address: address.parse()?,
            username: username.to_owned(),
            ..candidate_config()
        });
        assert_eq!(c.validate_remote(), expected, "{address} {username}");
    }
    Ok(())
}

#[test]
fn test_candidate_equivalence_ignores_network() {
    let a = Candidate::from(candidate_config());
    let b = Candidate::from(CandidateConfig {
        network_name: "eth1".to_owned(),
        ..candidate_config()
    });
    let c = Candidate::from(CandidateConfig {
        generation: 4,
        ..candidate_config()
    });
    assert!(a.is_equivalent(&b));
    assert_ne!(a, b);
    assert!(!a.is_equivalent(&c));
}

#[test]
fn test_candidate_serde() -> Result<()> {
    let c = Candidate::from(candidate_config());
    let json = serde_json::to_string(&c).map_err(|e| Error::Other(e.to_string()))?;
    assert!(json.contains("\"type\":\"stun\""));
    assert!(json.contains("\"protocol\":\"udp\""));
    let back: Candidate = serde_json::from_str(&json).map_err(|e| Error::Other(e.to_string()))?;
    assert_eq!(back, c);
    Ok(())
}

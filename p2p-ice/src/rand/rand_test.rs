use super::*;
use shared::error::Result;
use shared::util::is_base64;

#[test]
fn test_random_generator_collision() -> Result<()> {
    let test_cases: Vec<(&str, fn() -> String)> =
        vec![("PWD", generate_pwd), ("Ufrag", generate_ufrag)];

    const N: usize = 10;
    const ITERATION: usize = 10;

    for (name, generate) in test_cases {
        for _ in 0..ITERATION {
            let rs: Vec<String> = (0..N).map(|_| generate()).collect();

            for s in &rs {
                assert_eq!(s.len(), LEN_CREDENTIAL, "{name}: wrong length");
                assert!(is_base64(s), "{name}: {s} is not base64");
            }

            for i in 0..N {
                for j in i + 1..N {
                    assert_ne!(
                        rs[i], rs[j],
                        "{}: generateRandString caused collision: {} == {}",
                        name, rs[i], rs[j],
                    );
                }
            }
        }
    }

    Ok(())
}

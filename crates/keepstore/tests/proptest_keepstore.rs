//! Property-based tests for locators, signatures, and replication accounting.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use keepstore::locator::Locator;
use keepstore::{block_hash, BlobSigner, KeepError, MemoryVolume, Mount, PutProgress, Volume, VolumeConfig};
use proptest::prelude::*;

fn any_hash() -> impl Strategy<Value = String> {
    "[0-9a-f]{32}"
}

fn any_hint() -> impl Strategy<Value = String> {
    "[B-QS-Z][A-Za-z0-9_-]{0,12}"
}

fn any_token() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,24}"
}

fn mount(uuid: &str, classes: &[String], replication: u32) -> Mount {
    let mut config = VolumeConfig::memory(uuid).with_classes(classes.iter().cloned());
    config.replication = replication;
    Mount::new(&config, Arc::new(MemoryVolume::new(uuid)), 0)
}

proptest! {
    /// Formatting then parsing a locator yields the same locator.
    #[test]
    fn test_locator_display_parse(hash in any_hash(), size in proptest::option::of(0u64..(1 << 26)), hints in proptest::collection::vec(any_hint(), 0..4)) {
        let loc = Locator { hash, size, hints };
        let parsed = Locator::parse(&loc.to_string()).unwrap();
        prop_assert_eq!(parsed, loc);
    }

    /// Uppercase hex or short hashes never parse.
    #[test]
    fn test_locator_rejects_bad_hash(hash in "[0-9A-F]{32}") {
        prop_assume!(hash.chars().any(|c| c.is_ascii_uppercase()));
        prop_assert!(matches!(Locator::parse(&hash), Err(KeepError::InvalidLocator { .. })), "expected InvalidLocator");
        prop_assert!(Locator::parse(&hash[..31].to_lowercase()).is_err());
    }

    /// A signature verifies for the token and key that produced it, and for no other token.
    #[test]
    fn test_signature_binds_token(hash in any_hash(), size in 0u64..1000, token in any_token(), other in any_token(), ttl in 1u64..100_000) {
        let signer = BlobSigner::new("cluster-key", Duration::from_secs(ttl));
        let signed = signer.sign(&Locator::new(hash, size), &token).unwrap();
        prop_assert!(signer.verify(&signed, &token).is_ok());
        if other != token {
            prop_assert!(matches!(signer.verify(&signed, &other), Err(KeepError::Forbidden)));
        }
        let reparsed = Locator::parse(&signed.to_string()).unwrap();
        prop_assert!(signer.verify(&reparsed, &token).is_ok());
    }

    /// Past the expiry a genuine signature reports Expired, not Forbidden.
    #[test]
    fn test_signature_expiry(hash in any_hash(), expiry_secs in 1_000_000u64..2_000_000_000, late in 1u64..1_000_000) {
        let signer = BlobSigner::new("k", Duration::from_secs(60));
        let expiry = UNIX_EPOCH + Duration::from_secs(expiry_secs);
        let signed = signer.sign_until(&Locator::new(hash, 3), "tok", expiry).unwrap();
        prop_assert!(signer.verify_at(&signed, "tok", expiry).is_ok());
        prop_assert!(matches!(
            signer.verify_at(&signed, "tok", expiry + Duration::from_secs(late)),
            Err(KeepError::Expired)
        ));
    }

    /// Adding then removing any set of mounts restores the initial progress.
    #[test]
    fn test_put_progress_add_sub_restores(
        requested in proptest::collection::btree_set("[A-D]", 0..3),
        mounts in proptest::collection::vec((proptest::collection::vec("[A-D]", 1..3), 1u32..3), 1..6),
    ) {
        let requested: Vec<String> = requested.into_iter().collect();
        let mounts: Vec<Mount> = mounts
            .iter()
            .enumerate()
            .map(|(i, (classes, r))| mount(&format!("m{}", i), classes, *r))
            .collect();
        let initial = PutProgress::new(requested.clone());
        let mut pr = initial.clone();
        let mut total = 0;
        for m in &mounts {
            pr.add(m).unwrap();
            total += m.replication;
            prop_assert_eq!(pr.total_replication(), total);
        }
        for m in &mounts {
            pr.sub(m).unwrap();
        }
        prop_assert_eq!(pr, initial);
    }

    /// Once done, no mount is wanted; while not done, some unused mount serving a missing class is.
    #[test]
    fn test_put_progress_want_consistent(
        requested in proptest::collection::btree_set("[A-C]", 1..3),
        order in proptest::collection::vec(0usize..3, 0..6),
    ) {
        let classes = ["A", "B", "C"];
        let mounts: Vec<Mount> = classes
            .iter()
            .map(|c| mount(&format!("m{}", c), &[c.to_string()], 1))
            .collect();
        let mut pr = PutProgress::new(requested.iter().cloned());
        for i in order {
            if pr.want(&mounts[i]) {
                pr.add(&mounts[i]).unwrap();
            }
        }
        if pr.done() {
            prop_assert!(mounts.iter().all(|m| !pr.want(m)));
        } else {
            let missing = pr.missing_classes();
            prop_assert!(!missing.is_empty() || pr.total_replication() == 0);
            prop_assert!(mounts.iter().any(|m| pr.want(m)));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Blocks written to a memory volume read back byte-for-byte.
    #[test]
    fn test_memory_volume_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let vol = MemoryVolume::new("p");
            let hash = block_hash(&data);
            vol.put(&hash, &data).await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = vol.get(&hash, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], &data[..]);
            assert!(vol.compare(&hash, &data).await.is_ok());
            assert!(vol.mtime(&hash).await.unwrap() <= SystemTime::now());
        });
    }
}

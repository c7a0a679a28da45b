use crate::{Error, ObjectBucketClaim, Result};

const MAX_NAME_LEN: usize = 63;
const UUID_SUFFIX_LEN: usize = 36;

/// Split a `namespace/name` work queue key
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok((ns, name)),
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

pub fn claim_key(claim: &ObjectBucketClaim) -> Result<String> {
    let ns = claim
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::InvalidKey("claim without namespace".into()))?;
    let name = claim
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::InvalidKey("claim without name".into()))?;
    Ok(format!("{ns}/{name}"))
}

/// The bucket record name is a pure function of the claim key
pub fn object_bucket_name(key: &str) -> Result<String> {
    let (ns, name) = split_key(key)?;
    Ok(format!("obc-{ns}-{name}"))
}

/// Bucket name for dynamic provisioning. An explicit `bucketName` (including one
/// persisted by a previous attempt) wins over `generateBucketName`.
pub fn compose_bucket_name(claim: &ObjectBucketClaim) -> Result<String> {
    if !claim.spec.bucket_name.is_empty() {
        return Ok(claim.spec.bucket_name.clone());
    }
    if claim.spec.generate_bucket_name.is_empty() {
        return Err(Error::MissingBucketName(
            "expected either bucketName or generateBucketName defined".into(),
        ));
    }
    Ok(generate_bucket_name(&claim.spec.generate_bucket_name))
}

pub fn generate_bucket_name(prefix: &str) -> String {
    let max_base_len = MAX_NAME_LEN - UUID_SUFFIX_LEN - 1;
    let prefix: String = prefix.chars().take(max_base_len).collect();
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectBucketClaimSpec;

    #[test]
    fn keys_split() {
        assert_eq!(split_key("ns/b1").unwrap(), ("ns", "b1"));
        assert!(split_key("b1").is_err());
        assert!(split_key("/b1").is_err());
        assert!(split_key("a/b/c").is_err());
    }

    #[test]
    fn object_bucket_name_is_deterministic() {
        assert_eq!(object_bucket_name("ns/b1").unwrap(), "obc-ns-b1");
        assert_eq!(object_bucket_name("ns/b1").unwrap(), object_bucket_name("ns/b1").unwrap());
    }

    #[test]
    fn explicit_bucket_name_wins() {
        let claim = ObjectBucketClaim::new(
            "b1",
            ObjectBucketClaimSpec {
                bucket_name: "fixed".into(),
                generate_bucket_name: "gen".into(),
                ..Default::default()
            },
        );
        assert_eq!(compose_bucket_name(&claim).unwrap(), "fixed");
    }

    #[test]
    fn generated_names_fit_and_differ() {
        let long = "p".repeat(100);
        let a = generate_bucket_name(&long);
        let b = generate_bucket_name(&long);
        assert!(a.len() <= MAX_NAME_LEN, "{} too long", a);
        assert_ne!(a, b);
        assert!(generate_bucket_name("photos").starts_with("photos-"));
    }

    #[test]
    fn no_name_source_is_an_error() {
        let claim = ObjectBucketClaim::new("b1", ObjectBucketClaimSpec::default());
        assert!(matches!(compose_bucket_name(&claim), Err(Error::MissingBucketName(_))));
    }
}

use std::net::IpAddr;

use crate::config::{Config, ForcePolicy};
use crate::error::ValidationError;
use crate::keystore::{hash_key, Keystore};
use crate::record::{AgentRecord, IpPredicate};

/// Fully parsed, not-yet-validated enrollment request (spec.md §4.3
/// grammar: `OSSEC [PASS 'pw'] A:'name' [G:'g1,g2'] [IP:'addr'] [K:'hash']`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRequest {
    pub password: Option<String>,
    pub name: String,
    pub groups: Vec<String>,
    pub ip: Option<String>,
    pub key_hash: Option<String>,
}

/// Human-readable rejection, paired with the structured
/// [`ValidationError`] it was derived from. The dispatcher renders
/// `reason` as the first of the two reject lines (spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectReason {
    pub error: ValidationError,
    pub reason: String,
}

impl From<ValidationError> for RejectReason {
    fn from(error: ValidationError) -> Self {
        let reason = error.to_string();
        Self { error, reason }
    }
}

/// Result of a successful validation: the record to insert, plus the id
/// of an existing record the duplicate-resolution policy says must be
/// removed first (spec.md §4.3 step 4). The caller (dispatcher, under the
/// keystore lock) performs the actual `remove`/`add` calls; the validator
/// never mutates state itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentOutcome {
    pub record: AgentRecord,
    pub remove_existing: Option<u32>,
}

/// Parses and enforces policy for agent enrollment requests (spec.md
/// C3). Holds only configuration; it is `Send + Sync` and may be shared
/// across dispatcher threads without synchronization since it is never
/// mutated after construction.
#[derive(Debug, Clone)]
pub struct EnrollmentValidator {
    password: Option<String>,
    manager_hostname: String,
    force_source: bool,
    verify_host: bool,
    force: ForcePolicy,
}

impl EnrollmentValidator {
    pub fn new(config: &Config, password: Option<String>) -> Self {
        Self {
            password,
            manager_hostname: config.manager_hostname.clone().unwrap_or_default(),
            force_source: config.force_source,
            verify_host: config.verify_host,
            force: config.force.clone(),
        }
    }

    /// Parses the raw request grammar. Does not consult policy or the
    /// keystore.
    pub fn parse(raw: &str) -> Result<EnrollmentRequest, RejectReason> {
        let line = raw.trim_end_matches(['\r', '\n']);
        let rest = line
            .strip_prefix("OSSEC")
            .ok_or_else(|| RejectReason::from(ValidationError::Malformed))?;

        let mut rest = rest;
        let mut password = None;
        if let Some((value, after)) = extract(rest, "PASS '") {
            password = Some(value.to_string());
            rest = after;
        }

        let (name, after) =
            extract(rest, "A:'").ok_or_else(|| RejectReason::from(ValidationError::Malformed))?;
        rest = after;

        let mut groups = Vec::new();
        if let Some((value, after)) = extract(rest, "G:'") {
            groups = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            rest = after;
        }

        let mut ip = None;
        if let Some((value, after)) = extract(rest, "IP:'") {
            ip = Some(value.to_string());
            rest = after;
        }

        let mut key_hash = None;
        if let Some((value, _after)) = extract(rest, "K:'") {
            key_hash = Some(value.to_string());
        }

        Ok(EnrollmentRequest {
            password,
            name: name.to_string(),
            groups,
            ip,
            key_hash,
        })
    }

    /// Runs the full pipeline: parse, password check, name/ip validation,
    /// duplicate resolution. `peer_ip` is the TLS peer's address (used for
    /// `force_source`); `now` is the current unix timestamp, threaded in
    /// explicitly so the time-based force-policy branches are testable.
    pub fn validate(
        &self,
        raw: &str,
        peer_ip: IpAddr,
        keystore: &Keystore,
        now: u64,
    ) -> Result<EnrollmentOutcome, RejectReason> {
        let request = Self::parse(raw)?;

        if self.password.is_some() {
            let expected = self.password.as_deref().unwrap_or_default();
            let supplied = request.password.as_deref().unwrap_or("");
            if request.password.is_none() || !crate::password::constant_time_eq(expected, supplied) {
                return Err(ValidationError::BadPassword.into());
            }
        }

        self.validate_name(&request.name)?;

        let ip = self.validate_ip(request.ip.as_deref(), peer_ip)?;

        let group = if request.groups.is_empty() {
            None
        } else {
            Some(request.groups.join(","))
        };

        let remove_existing = self.resolve_duplicates(&request, &ip, keystore, now)?;

        let record = AgentRecord::new(0, request.name, ip, String::new(), group);
        Ok(EnrollmentOutcome { record, remove_existing })
    }

    fn validate_name(&self, name: &str) -> Result<(), RejectReason> {
        if name.is_empty() || name.len() > 128 {
            return Err(ValidationError::InvalidName(name.to_string()).into());
        }
        let allowed = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !allowed {
            return Err(ValidationError::InvalidName(name.to_string()).into());
        }
        if name.eq_ignore_ascii_case("localhost")
            || (!self.manager_hostname.is_empty() && name == self.manager_hostname)
        {
            return Err(ValidationError::InvalidName(name.to_string()).into());
        }
        Ok(())
    }

    fn validate_ip(&self, requested: Option<&str>, peer_ip: IpAddr) -> Result<IpPredicate, RejectReason> {
        let ip = match requested {
            None => IpPredicate::Any,
            Some(raw) => IpPredicate::parse(raw)
                .ok_or_else(|| RejectReason::from(ValidationError::InvalidIp(raw.to_string())))?,
        };
        // `any` never participates in the source-ip check; an exact
        // literal or CIDR block must contain the connection's actual
        // peer address.
        if self.force_source && !matches!(ip, IpPredicate::Any) && !ip.matches(&peer_ip) {
            return Err(ValidationError::SourceMismatch.into());
        }
        Ok(ip)
    }

    /// Implements spec.md §4.3 step 4's priority order: key hash, then
    /// name, then ip. Each match is either an allowed replacement (returns
    /// the id to remove) or a hard reject.
    ///
    /// The force-policy's time thresholds are evaluated against
    /// `AgentRecord::created_at`, the only timestamp this data model
    /// carries; true "time since last disconnect" requires live
    /// keepalive tracking that spec.md places outside the keystore
    /// (out of scope here, see SPEC_FULL.md).
    fn resolve_duplicates(
        &self,
        request: &EnrollmentRequest,
        ip: &IpPredicate,
        keystore: &Keystore,
        now: u64,
    ) -> Result<Option<u32>, RejectReason> {
        if let Some(hash) = &request.key_hash {
            if let Some(existing) = keystore.find_by_key_hash(hash) {
                return if self.force.key_mismatch {
                    Ok(Some(existing.id))
                } else {
                    Err(ValidationError::DuplicateKeyHash.into())
                };
            }
        }

        if let Some(existing) = keystore.find_by_name(&request.name) {
            return if self.time_override_allowed(existing, now) {
                Ok(Some(existing.id))
            } else {
                Err(ValidationError::DuplicateName(request.name.clone()).into())
            };
        }

        if !matches!(ip, IpPredicate::Any) {
            if let Some(existing) = keystore.find_by_ip(ip) {
                return if self.time_override_allowed(existing, now) {
                    Ok(Some(existing.id))
                } else {
                    Err(ValidationError::DuplicateIp(ip.to_string()).into())
                };
            }
        }

        Ok(None)
    }

    fn time_override_allowed(&self, existing: &AgentRecord, now: u64) -> bool {
        let age = now.saturating_sub(existing.created_at);
        let disc = self
            .force
            .disconnected_time
            .map(|t| age >= t)
            .unwrap_or(false);
        let reg = self
            .force
            .after_registration_time
            .map(|t| age >= t)
            .unwrap_or(false);
        disc || reg
    }
}

/// If `s.trim_start()` begins with `marker`, returns the text up to the
/// matching closing quote and the remainder after it.
fn extract<'a>(s: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let trimmed = s.trim_start();
    let rest = trimmed.strip_prefix(marker)?;
    let end = rest.find('\'')?;
    Some((&rest[..end], &rest[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn validator() -> EnrollmentValidator {
        EnrollmentValidator::new(&Config::default(), None)
    }

    #[test]
    fn parses_minimal_request() {
        let req = EnrollmentValidator::parse("OSSEC A:'alpha'\n").unwrap();
        assert_eq!(req.name, "alpha");
        assert!(req.ip.is_none());
        assert!(req.groups.is_empty());
    }

    #[test]
    fn parses_full_request() {
        let req = EnrollmentValidator::parse(
            "OSSEC PASS 'secret' A:'alpha' G:'g1,g2' IP:'10.0.0.1' K:'deadbeef'\n",
        )
        .unwrap();
        assert_eq!(req.password.as_deref(), Some("secret"));
        assert_eq!(req.name, "alpha");
        assert_eq!(req.groups, vec!["g1", "g2"]);
        assert_eq!(req.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(req.key_hash.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn rejects_missing_name() {
        assert!(EnrollmentValidator::parse("OSSEC\n").is_err());
    }

    #[test]
    fn rejects_request_without_ossec_prefix() {
        assert!(EnrollmentValidator::parse("A:'alpha'\n").is_err());
    }

    #[test]
    fn s1_standalone_add_succeeds_with_any_ip() {
        let ks = Keystore::new();
        let outcome = validator()
            .validate("OSSEC A:'alpha' IP:'any'\n", "10.0.0.9".parse().unwrap(), &ks, 1_000)
            .unwrap();
        assert_eq!(outcome.record.name, "alpha");
        assert!(outcome.remove_existing.is_none());
    }

    #[test]
    fn s2_duplicate_name_is_rejected() {
        let mut ks = Keystore::new();
        ks.add(AgentRecord::new(0, "alpha".into(), IpPredicate::Any, "k1".into(), None))
            .unwrap();
        let err = validator()
            .validate("OSSEC A:'alpha' IP:'any'\n", "10.0.0.9".parse().unwrap(), &ks, 1_000)
            .unwrap_err();
        assert_eq!(err.error, ValidationError::DuplicateName("alpha".into()));
    }

    #[test]
    fn s3_forced_replace_by_key_hash() {
        let mut ks = Keystore::new();
        let old_id = ks
            .add(AgentRecord::new(0, "alpha".into(), IpPredicate::Any, "oldkey".into(), None))
            .unwrap();
        let hash = hash_key("oldkey");

        let mut config = Config::default();
        config.force.key_mismatch = true;
        let v = EnrollmentValidator::new(&config, None);

        let outcome = v
            .validate(
                &format!("OSSEC A:'beta' IP:'any' K:'{hash}'\n"),
                "10.0.0.9".parse().unwrap(),
                &ks,
                1_000,
            )
            .unwrap();
        assert_eq!(outcome.remove_existing, Some(old_id));
        assert_eq!(outcome.record.name, "beta");
    }

    #[test]
    fn s6_wrong_password_is_rejected() {
        let config = Config {
            use_password: true,
            ..Config::default()
        };
        let v = EnrollmentValidator::new(&config, Some("abc".to_string()));
        let ks = Keystore::new();
        let err = v
            .validate("OSSEC A:'alpha' IP:'any'\n", "10.0.0.9".parse().unwrap(), &ks, 1_000)
            .unwrap_err();
        assert_eq!(err.error, ValidationError::BadPassword);
    }

    #[test]
    fn force_source_rejects_mismatched_ip() {
        let config = Config {
            force_source: true,
            ..Config::default()
        };
        let v = EnrollmentValidator::new(&config, None);
        let ks = Keystore::new();
        let err = v
            .validate(
                "OSSEC A:'alpha' IP:'10.0.0.1'\n",
                "10.0.0.2".parse().unwrap(),
                &ks,
                1_000,
            )
            .unwrap_err();
        assert_eq!(err.error, ValidationError::SourceMismatch);
    }

    #[test]
    fn force_source_accepts_ip_within_requested_cidr() {
        let config = Config {
            force_source: true,
            ..Config::default()
        };
        let v = EnrollmentValidator::new(&config, None);
        let ks = Keystore::new();
        let outcome = v
            .validate(
                "OSSEC A:'alpha' IP:'10.0.0.0/24'\n",
                "10.0.0.42".parse().unwrap(),
                &ks,
                1_000,
            )
            .unwrap();
        assert_eq!(outcome.record.ip, IpPredicate::parse("10.0.0.0/24").unwrap());
    }

    #[test]
    fn reserved_name_localhost_is_rejected() {
        let err = validator()
            .validate("OSSEC A:'localhost'\n", "10.0.0.9".parse().unwrap(), &Keystore::new(), 1_000)
            .unwrap_err();
        assert!(matches!(err.error, ValidationError::InvalidName(_)));
    }
}

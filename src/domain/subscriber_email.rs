use validator::validate_email;

/// A syntactically valid, normalised (trimmed, lower-cased) email address.
///
/// Every lookup against the suppression list and every delivery row is keyed
/// by this form, so two spellings of the same mailbox never diverge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberEmail(String);

impl SubscriberEmail {
    pub fn parse(s: impl AsRef<str>) -> Result<SubscriberEmail, String> {
        let normalized = normalize(s.as_ref());
        if validate_email(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(format!("{} is not a valid subscriber email.", s.as_ref()))
        }
    }

    /// The part after the `@`, used to pick a throttle domain class.
    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

pub fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

impl AsRef<str> for SubscriberEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriberEmail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::SubscriberEmail;
    use claim::{assert_err, assert_ok};
    use fake::faker::internet::en::SafeEmail;
    use fake::Fake;

    #[derive(Debug, Clone)]
    struct ValidEmailFixture(pub String);

    impl quickcheck::Arbitrary for ValidEmailFixture {
        fn arbitrary<G: quickcheck::Gen>(g: &mut G) -> Self {
            let email = SafeEmail().fake_with_rng(g);
            Self(email)
        }
    }

    #[test]
    fn empty_string_is_rejected() {
        assert_err!(SubscriberEmail::parse(""));
    }

    #[test]
    fn email_missing_at_symbol_is_rejected() {
        assert_err!(SubscriberEmail::parse("ursuladomain.com"));
    }

    #[test]
    fn email_missing_subject_is_rejected() {
        assert_err!(SubscriberEmail::parse("@domain.com"));
    }

    #[test]
    fn surrounding_whitespace_and_case_are_normalised() {
        let email = SubscriberEmail::parse("  Ursula@Domain.COM ").unwrap();
        assert_eq!(email.as_ref(), "ursula@domain.com");
        assert_eq!(email.domain(), "domain.com");
    }

    #[quickcheck_macros::quickcheck]
    fn valid_emails_are_parsed_successfully(valid_email: ValidEmailFixture) -> bool {
        SubscriberEmail::parse(valid_email.0).is_ok()
    }

    #[quickcheck_macros::quickcheck]
    fn parsing_is_idempotent(valid_email: ValidEmailFixture) -> bool {
        let once = SubscriberEmail::parse(valid_email.0.to_uppercase()).unwrap();
        let twice = SubscriberEmail::parse(once.as_ref()).unwrap();
        assert_ok!(SubscriberEmail::parse(twice.as_ref()));
        once == twice
    }
}

//! Client certificate selection by nickname.

/// Picks which locally held client certificate to present.
///
/// Bound to the configured nickname when the factory is built and consulted
/// by the TLS layer when the server asks for a client certificate. Holds no
/// reference to the factory that created it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCertSelector {
    target: Option<String>,
}

impl ClientCertSelector {
    pub fn new(target: Option<String>) -> Self {
        Self { target }
    }

    /// A selector that always declines.
    pub fn none() -> Self {
        Self { target: None }
    }

    /// Return the first candidate matching the target nickname, ignoring
    /// case, or `None` to decline client authentication.
    pub fn select<'a, S: AsRef<str>>(&self, candidates: &'a [S]) -> Option<&'a str> {
        let target = self.target.as_deref()?;

        let selection = candidates
            .iter()
            .map(|candidate| candidate.as_ref())
            .inspect(|candidate| tracing::trace!(candidate, "Candidate client certificate"))
            .find(|candidate| eq_ignore_case(target, candidate));

        match selection {
            Some(nickname) => tracing::debug!(nickname, "Desired client certificate found"),
            None => tracing::debug!(
                desired = target,
                candidates = candidates.len(),
                "Desired client certificate not offered, declining client auth"
            ),
        }
        selection
    }
}

/// Character-wise case-insensitive equality: both strings have the same
/// number of characters and each pair is equal, equal after upper-casing, or
/// equal after lower-casing the upper-cased forms. Only one-to-one case
/// mappings apply, so `ß` never matches `ss`.
fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.chars().count() == b.chars().count()
        && a.chars().zip(b.chars()).all(|(x, y)| chars_eq_ignore_case(x, y))
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    if a == b {
        return true;
    }
    let (upper_a, upper_b) = (simple_upper(a), simple_upper(b));
    upper_a == upper_b || simple_lower(upper_a) == simple_lower(upper_b)
}

fn simple_upper(c: char) -> char {
    single(c, c.to_uppercase())
}

fn simple_lower(c: char) -> char {
    // U+0130 is the one character whose lowercase form expands
    if c == '\u{130}' {
        return 'i';
    }
    single(c, c.to_lowercase())
}

/// The mapped character when the mapping is one-to-one, otherwise `c`.
fn single(c: char, mut mapped: impl Iterator<Item = char>) -> char {
    match (mapped.next(), mapped.next()) {
        (Some(m), None) => m,
        _ => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select<'a>(target: Option<&str>, candidates: &'a [&'a str]) -> Option<&'a str> {
        ClientCertSelector::new(target.map(str::to_string)).select(candidates)
    }

    #[test]
    fn exact_match_is_selected() {
        let candidates = ["UserCert", "AdminCert", "Other"];
        assert_eq!(select(Some("AdminCert"), &candidates), Some("AdminCert"));
    }

    #[test]
    fn match_ignores_case_and_returns_candidate_spelling() {
        let candidates = ["usercert", "adminCERT"];
        assert_eq!(select(Some("AdminCert"), &candidates), Some("adminCERT"));
    }

    #[test]
    fn first_match_wins() {
        let candidates = ["ADMINCERT", "AdminCert", "admincert"];
        let selected = select(Some("AdminCert"), &candidates).unwrap();
        assert!(std::ptr::eq(selected, candidates[0]));
    }

    #[test]
    fn no_match_declines() {
        assert_eq!(select(Some("AdminCert"), &["UserCert", "Other"]), None);
        assert_eq!(select(Some("AdminCert"), &[]), None);
    }

    #[test]
    fn partial_names_do_not_match() {
        assert_eq!(select(Some("Admin"), &["AdminCert"]), None);
        assert_eq!(select(Some("AdminCert"), &["AdminCert2"]), None);
    }

    #[test]
    fn without_target_always_declines() {
        assert_eq!(select(None, &[]), None);
        assert_eq!(select(None, &["AdminCert"]), None);
        assert_eq!(select(None, &["UserCert", "AdminCert", "Other"]), None);
        assert_eq!(ClientCertSelector::none().select::<String>(&[]), None);
    }

    #[test]
    fn works_with_owned_candidates() {
        let candidates = vec!["server-cert".to_string(), "Subsystem Cert".to_string()];
        let selector = ClientCertSelector::new(Some("subsystem cert".into()));
        assert_eq!(selector.select(&candidates), Some("Subsystem Cert"));
    }

    #[test]
    fn greek_final_sigma_matches_capital_sigma() {
        assert_eq!(select(Some("ΑΣ"), &["ας"]), Some("ας"));
        assert_eq!(select(Some("ας"), &["ΑΣ"]), Some("ΑΣ"));
        assert_eq!(select(Some("σ"), &["ς"]), Some("ς"));
    }

    #[test]
    fn dotted_capital_i_matches_plain_i() {
        assert_eq!(select(Some("İ"), &["i"]), Some("i"));
        assert_eq!(select(Some("adminİ"), &["ADMINI"]), Some("ADMINI"));
    }

    #[test]
    fn kelvin_sign_matches_k() {
        assert_eq!(select(Some("\u{212A}ey"), &["key"]), Some("key"));
    }

    #[test]
    fn expanding_case_mappings_do_not_match() {
        assert_eq!(select(Some("straße"), &["STRASSE"]), None);
        assert_eq!(select(Some("ß"), &["s"]), None);
        assert_eq!(select(Some("ß"), &["ß"]), Some("ß"));
    }

    #[test]
    fn length_must_agree() {
        assert_eq!(select(Some("ab"), &["a", "abc", "AB"]), Some("AB"));
    }

    #[test]
    fn selection_is_deterministic() {
        let selector = ClientCertSelector::new(Some("b".into()));
        let candidates = ["a", "B", "b"];
        let first = selector.select(&candidates);
        for _ in 0..10 {
            assert_eq!(selector.select(&candidates), first);
        }
    }
}

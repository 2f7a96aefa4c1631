//! Service worker scope matching.

use url::Url;

/// Returns true if `url` falls under `scope`.
///
/// A scope controls every URL whose serialization starts with the scope's
/// serialization; fragments never take part in the comparison.
pub fn scope_matches(scope: &Url, url: &Url) -> bool {
	let mut url = url.clone();
	url.set_fragment(None);
	url.as_str().starts_with(scope.as_str())
}

/// Tracks the longest scope matching a single client URL.
///
/// Candidates are fed one at a time. A candidate replaces the current best only
/// when its scope is strictly longer, so among equal-length matches the first
/// candidate offered wins.
#[derive(Debug)]
pub struct LongestScopeMatcher<'a> {
	url: &'a Url,
	longest: Option<usize>,
}

impl<'a> LongestScopeMatcher<'a> {
	pub fn new(url: &'a Url) -> Self {
		Self { url, longest: None }
	}

	/// Offers `scope` as a candidate. Returns true if it became the best match.
	pub fn match_longest(&mut self, scope: &Url) -> bool {
		if !scope_matches(scope, self.url) {
			return false;
		}
		let len = scope.as_str().len();
		if self.longest.is_some_and(|best| best >= len) {
			return false;
		}
		self.longest = Some(len);
		true
	}
}

//! Compiled domain set with exact and subdomain matching.
//!
//! Three kinds of entries are supported:
//!
//! - **Exact** (`example.org`): matches only that name
//! - **Root** (`example.net`): matches the name and every subdomain
//! - **Subdomain** (`.example.invalid`): matches every subdomain, not the name itself
//!
//! Entries are stored label-reversed (`org.example`) in sorted vectors and
//! looked up with binary search, once for the name and once per ancestor.
//! Names are compared lower-cased with any trailing dot trimmed.
//!
//! # Example
//!
//! ```
//! use craftgate_networking::DomainMatcher;
//!
//! let matcher = DomainMatcher::builder()
//!     .add_domain("example.org")
//!     .add_domain_suffix("example.net")
//!     .add_domain_suffix(".example.invalid")
//!     .build();
//!
//! assert!(matcher.matches("example.org"));
//! assert!(!matcher.matches("sub.example.org"));
//! assert!(matcher.matches("a.b.example.net"));
//! assert!(!matcher.matches("example.invalid"));
//! ```

/// Immutable domain set. Cheap to query from many tasks at once.
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    exact: Vec<String>,
    roots: Vec<String>,
    subdomains: Vec<String>,
}

impl DomainMatcher {
    #[must_use]
    pub fn builder() -> DomainMatcherBuilder {
        DomainMatcherBuilder::new()
    }

    /// Whether `domain` is in the set.
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        let normalized = normalize(domain);
        if normalized.is_empty() {
            return false;
        }
        let key = reverse_labels(&normalized);

        if contains(&self.exact, &key) || contains(&self.roots, &key) {
            return true;
        }

        let mut end = key.len();
        while let Some(dot) = key[..end].rfind('.') {
            let ancestor = &key[..dot];
            if contains(&self.roots, ancestor) || contains(&self.subdomains, ancestor) {
                return true;
            }
            end = dot;
        }
        false
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.roots.is_empty() && self.subdomains.is_empty()
    }

    /// Total number of distinct entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.roots.len() + self.subdomains.len()
    }
}

/// Collects entries for a [`DomainMatcher`].
#[derive(Debug, Default)]
pub struct DomainMatcherBuilder {
    exact: Vec<String>,
    roots: Vec<String>,
    subdomains: Vec<String>,
}

impl DomainMatcherBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exact-match entry.
    #[must_use]
    pub fn add_domain(mut self, domain: impl AsRef<str>) -> Self {
        self.push_domain(domain.as_ref());
        self
    }

    /// Add a suffix entry: `.example.com` matches subdomains only,
    /// `example.com` matches the name and its subdomains.
    #[must_use]
    pub fn add_domain_suffix(mut self, suffix: impl AsRef<str>) -> Self {
        self.push_domain_suffix(suffix.as_ref());
        self
    }

    /// In-place variant of [`add_domain`](Self::add_domain), for loops.
    pub fn push_domain(&mut self, domain: &str) {
        let normalized = normalize(domain);
        if !normalized.is_empty() {
            self.exact.push(reverse_labels(&normalized));
        }
    }

    /// In-place variant of [`add_domain_suffix`](Self::add_domain_suffix).
    pub fn push_domain_suffix(&mut self, suffix: &str) {
        match suffix.strip_prefix('.') {
            Some(rest) => {
                let normalized = normalize(rest);
                if !normalized.is_empty() {
                    self.subdomains.push(reverse_labels(&normalized));
                }
            }
            None => {
                let normalized = normalize(suffix);
                if !normalized.is_empty() {
                    self.roots.push(reverse_labels(&normalized));
                }
            }
        }
    }

    #[must_use]
    pub fn build(self) -> DomainMatcher {
        DomainMatcher {
            exact: sorted(self.exact),
            roots: sorted(self.roots),
            subdomains: sorted(self.subdomains),
        }
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// `sub.example.com` -> `com.example.sub`
fn reverse_labels(domain: &str) -> String {
    domain.rsplit('.').collect::<Vec<_>>().join(".")
}

fn sorted(mut entries: Vec<String>) -> Vec<String> {
    entries.sort_unstable();
    entries.dedup();
    entries
}

fn contains(entries: &[String], key: &str) -> bool {
    entries
        .binary_search_by(|entry| entry.as_str().cmp(key))
        .is_ok()
}

use std::fmt;

const DIGEST_ALGORITHM: &str = "sha256:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    MissingRepository,
    EmptyTag(String),
    InvalidDigest(String),
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::EmptyTag(image) => write!(f, "empty tag in image: {}", image),
            ParseError::InvalidDigest(digest) => write!(f, "invalid digest: {}", digest),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::MissingRepository);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let (without_digest, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(ParseError::InvalidDigest(digest.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon only denotes a tag when it comes after the last slash,
        // otherwise it belongs to a registry port.
        let last_slash = without_digest.rfind('/');
        let (without_tag, tag) = match without_digest.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                let tag = &without_digest[pos + 1..];
                if tag.is_empty() {
                    return Err(ParseError::EmptyTag(s.to_string()));
                }
                (&without_digest[..pos], Some(tag.to_string()))
            }
            _ => (without_digest, None),
        };

        let (registry, repository) = match without_tag.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (Some(first.to_string()), rest),
            _ => (None, without_tag),
        };

        if repository.is_empty() || repository.starts_with('/') || repository.ends_with('/') {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }
        if registry.as_deref() == Some("") {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// `[registry/]repository`, without tag or digest.
    pub fn name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// True when the reference pins a version, either by tag or by digest.
    pub fn is_pinned(&self) -> bool {
        self.tag.is_some() || self.digest.is_some()
    }
}

/// The first path segment names a registry when it looks like a host:
/// it carries a domain dot or a port, or it is `localhost`.
pub fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Cheap plausibility check shared by the scanners and the validator: not
/// empty, no whitespace, not a URL, and carrying a path or version separator.
pub fn is_candidate(s: &str) -> bool {
    !s.is_empty()
        && !s.contains(' ')
        && !s.starts_with("http://")
        && !s.starts_with("https://")
        && (s.contains('/') || s.contains(':'))
}

fn is_valid_digest(digest: &str) -> bool {
    digest
        .strip_prefix(DIGEST_ALGORITHM)
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

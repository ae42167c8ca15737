use std::path::PathBuf;

/// Cookie bundle handed to the extractor for authenticated upstream requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamCredential {
    cookies_file: Option<PathBuf>,
}

impl UpstreamCredential {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_cookies(path: impl Into<PathBuf>) -> Self {
        Self {
            cookies_file: Some(path.into()),
        }
    }

    pub fn cookies_file(&self) -> Option<&PathBuf> {
        self.cookies_file.as_ref()
    }

    pub fn attempts(&self) -> AttemptPolicy<'_> {
        AttemptPolicy::new(self)
    }
}

/// One upstream try: either with the configured cookies or without any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt<'a> {
    Authenticated(&'a PathBuf),
    Anonymous,
}

impl<'a> Attempt<'a> {
    pub fn cookies(&self) -> Option<&'a PathBuf> {
        match self {
            Self::Authenticated(path) => Some(path),
            Self::Anonymous => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

/// Yields the authenticated attempt (when configured) followed by exactly
/// one anonymous attempt.
#[derive(Debug, Clone)]
pub struct AttemptPolicy<'a> {
    pending: Vec<Attempt<'a>>,
}

impl<'a> AttemptPolicy<'a> {
    fn new(credential: &'a UpstreamCredential) -> Self {
        let mut pending = vec![Attempt::Anonymous];
        if let Some(path) = credential.cookies_file.as_ref() {
            pending.push(Attempt::Authenticated(path));
        }
        Self { pending }
    }
}

impl<'a> Iterator for AttemptPolicy<'a> {
    type Item = Attempt<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pending.pop()
    }
}

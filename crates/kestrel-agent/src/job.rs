use regex::Regex;

/// Name filter of a job.
#[derive(Clone, Debug)]
struct Filter {
    pattern: String,

    /// Set if the pattern is a valid regular expression.
    regex: Option<Regex>,
}

impl Filter {
    fn new(pattern: String) -> Self {
        let regex = Regex::new(&pattern)
            .inspect_err(|e| tracing::debug!(%pattern, error = %e, "literal filter"))
            .ok();

        Self { pattern, regex }
    }

    fn matches(&self, name: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(name),
            None => name.contains(&self.pattern),
        }
    }
}

/// Debugged job, deciding which of the processes started within it get
/// attached.
#[derive(Debug)]
pub struct DebuggedJob {
    koid: u64,
    filters: Vec<Filter>,
}

impl DebuggedJob {
    /// Creates a job without filters.
    pub fn new(koid: u64) -> Self {
        Self {
            koid,
            filters: Vec::new(),
        }
    }

    /// Returns the kernel identity of the job.
    pub fn koid(&self) -> u64 {
        self.koid
    }

    /// Replaces the filters.
    ///
    /// A filter is a regular expression if it compiles as one, a literal
    /// substring otherwise.
    pub fn set_filters(&mut self, filters: Vec<String>) {
        self.filters = filters.into_iter().map(Filter::new).collect();
    }

    /// Returns the filters, in matching order.
    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|f| f.pattern.as_str())
    }

    /// Returns the first filter matching a process name.
    pub fn match_process(&self, name: &str) -> Option<&str> {
        self.filters
            .iter()
            .find(|f| f.matches(name))
            .map(|f| f.pattern.as_str())
    }
}

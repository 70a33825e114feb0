use std::sync::Arc;

/// A resource record that could not be turned into a usable extension.
///
/// Failures are accumulated during the discovery sweep and surfaced later in
/// [`ExtensionError::NotFound`] messages instead of aborting the load.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    /// The offending record, as written in the resource file.
    pub line: String,
    /// Why the record was rejected.
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExtensionError {
    #[error("extension name must not be empty (extension point {interface})")]
    EmptyName { interface: &'static str },

    #[error("no such extension '{name}' for {interface}{causes}")]
    NotFound {
        interface: &'static str,
        name: String,
        causes: String,
    },

    #[error("more than one adaptive implementation for {interface}: {first} and {second}")]
    AmbiguousAdaptive {
        interface: &'static str,
        first: String,
        second: String,
    },

    #[error("duplicate extension name '{name}' for {interface}: {first} and {second}")]
    DuplicateName {
        interface: &'static str,
        name: String,
        first: String,
        second: String,
    },

    #[error("more than one default extension name on {interface}: {names}")]
    MultipleDefaults {
        interface: &'static str,
        names: String,
    },

    #[error("no adaptive method on extension point {interface}, refusing to build a dispatcher")]
    NoAdaptiveMethod { interface: &'static str },

    #[error("method '{method}' of {interface} is not an adaptive method")]
    UnsupportedMethod {
        interface: &'static str,
        method: &'static str,
    },

    #[error("no url available to adaptive call {interface}::{method}")]
    NoUrl {
        interface: &'static str,
        method: &'static str,
    },

    #[error("failed to resolve an extension name for {interface} from url '{url}' using keys {keys:?}")]
    NoNameInUrl {
        interface: &'static str,
        url: String,
        keys: Vec<String>,
    },

    #[error("extension '{name}' of {interface} could not be instantiated: {reason}")]
    Instantiation {
        interface: &'static str,
        name: String,
        reason: String,
    },

    #[error("failed to create adaptive instance for {interface}: {source}")]
    AdaptiveCreation {
        interface: &'static str,
        source: Arc<ExtensionError>,
    },

    #[error("extension name '{name}' already registered for {interface}")]
    AlreadyRegistered {
        interface: &'static str,
        name: String,
    },

    #[error("extension name '{name}' is not registered for {interface}")]
    NotRegistered {
        interface: &'static str,
        name: String,
    },
}

impl ExtensionError {
    /// Builds a [`NotFound`](Self::NotFound) error, folding in the load
    /// failures captured during discovery.
    ///
    /// When a failure's record mentions the requested name, only that cause
    /// is reported; otherwise every accumulated failure is enumerated.
    pub(crate) fn not_found(interface: &'static str, name: &str, failures: &[LoadFailure]) -> Self {
        let lowered = name.to_lowercase();
        let matching: Vec<&LoadFailure> = failures
            .iter()
            .filter(|f| f.line.to_lowercase().contains(&lowered))
            .collect();
        let relevant: Vec<&LoadFailure> = if matching.is_empty() {
            failures.iter().collect()
        } else {
            matching
        };

        let mut causes = String::new();
        for (i, failure) in relevant.iter().enumerate() {
            if i == 0 {
                causes.push_str(", possible causes:");
            }
            causes.push_str(&format!("\n({}) {}: {}", i + 1, failure.line, failure.message));
        }

        ExtensionError::NotFound {
            interface,
            name: name.to_string(),
            causes,
        }
    }

    /// The remembered root cause of a sticky adaptive failure.
    pub fn sticky_cause(&self) -> Option<&Arc<ExtensionError>> {
        match self {
            ExtensionError::AdaptiveCreation { source, .. } => Some(source),
            _ => None,
        }
    }
}

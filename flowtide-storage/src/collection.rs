use std::fmt;

/// The document collections the pipeline reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// Application settings, a single document with id `config`.
    Settings,
    Connections,
    Matches,
    /// Delivered stream bytes, chunked per direction.
    ConnectionStreams,
    /// Port to service name overrides.
    Services,
    /// Stored detection rules.
    Rules,
    /// Import session summaries.
    Sessions,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Settings,
        Collection::Connections,
        Collection::Matches,
        Collection::ConnectionStreams,
        Collection::Services,
        Collection::Rules,
        Collection::Sessions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Settings => "settings",
            Collection::Connections => "connections",
            Collection::Matches => "matches",
            Collection::ConnectionStreams => "connection_streams",
            Collection::Services => "services",
            Collection::Rules => "rules",
            Collection::Sessions => "sessions",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

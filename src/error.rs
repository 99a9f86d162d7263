use thiserror::Error;

/// Pipeline stage names used in timeout reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Hierarchy,
    Calculation,
    Optimization,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Hierarchy => "hierarchy",
            Stage::Calculation => "calculation",
            Stage::Optimization => "optimization",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("link {link} references node index {index} outside 0..{node_count}")]
    InvalidNodeReference {
        link: usize,
        index: usize,
        node_count: usize,
    },

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("{stage} stage exceeded its time budget")]
    StageTimeout { stage: Stage },

    #[error("no nodes or links to route")]
    EmptyInput,

    #[error("fallback routing failed")]
    FallbackFailed {
        #[source]
        source: Box<RoutingError>,
    },
}

impl RoutingError {
    /// Timeouts and computational exceptions escalate to fallback routing,
    /// which skips the offending piece instead of failing the whole batch.
    /// Empty input and a failed fallback are terminal.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            RoutingError::StageTimeout { .. }
                | RoutingError::DegenerateGeometry(_)
                | RoutingError::InvalidNodeReference { .. }
        )
    }
}

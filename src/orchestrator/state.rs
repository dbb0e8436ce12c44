use std::fmt;

/// Position of the orchestrator in its linear pipeline.
///
/// `Waiting*` states sit between stages; `*ing` states are active while the
/// stage's operations are outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OrchestratorState {
    /// Idle; `start_initialize` is allowed.
    #[default]
    WaitingForInitialize,
    /// Backend initialization outstanding.
    Initializing,
    /// About to check for catalog updates.
    WaitingForCatalogCheck,
    /// Catalog check outstanding.
    CatalogChecking,
    /// Pending catalog ids known; about to apply them.
    WaitingForCatalogUpdate,
    /// Catalog update outstanding.
    CatalogUpdating,
    /// Catalog resolved; about to size every label.
    WaitingForSizeDownload,
    /// Size queries outstanding.
    SizeDownloading,
    /// Total size known; `start_download` is allowed.
    WaitingForDownload,
    /// Downloads outstanding.
    Downloading,
    /// Run completed.
    FinishDownload,
}

impl OrchestratorState {
    /// Name as shown in logs and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingForInitialize => "WaitingForInitialize",
            Self::Initializing => "Initializing",
            Self::WaitingForCatalogCheck => "WaitingForCatalogCheck",
            Self::CatalogChecking => "CatalogChecking",
            Self::WaitingForCatalogUpdate => "WaitingForCatalogUpdate",
            Self::CatalogUpdating => "CatalogUpdating",
            Self::WaitingForSizeDownload => "WaitingForSizeDownload",
            Self::SizeDownloading => "SizeDownloading",
            Self::WaitingForDownload => "WaitingForDownload",
            Self::Downloading => "Downloading",
            Self::FinishDownload => "FinishDownload",
        }
    }

    /// True while a stage has operations outstanding.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::CatalogChecking
                | Self::CatalogUpdating
                | Self::SizeDownloading
                | Self::Downloading
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

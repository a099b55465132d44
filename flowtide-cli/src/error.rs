use flowtide_engine::SessionState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Server address and flag regex are required (config file, --server/--flag or FLOWTIDE_CAPTURE__*)")]
    MissingSettings,

    #[error("Import {session_id} ended {state:?} with {errors} error(s)")]
    ImportFailed {
        session_id: String,
        state: SessionState,
        errors: usize,
    },
}

//! State store: atomic save, guarded+validated load (§4.2).
//!
//! Ported from `orch/state/store.py::save_state_atomic` / `load_state`.

use std::path::Path;

use crate::atomic::write_atomic;
use crate::error::{OrchError, OrchResult};
use crate::path_guard::guarded_open_read;
use crate::paths::state_path;
use crate::state::{validate_run_state, RunState};

pub fn save_state_atomic(run_dir: &Path, state: &RunState) -> OrchResult<()> {
    let json = serde_json::to_string_pretty(state).map_err(|e| OrchError::state(format!("cannot encode state: {e}")))?;
    let mut bytes = json.into_bytes();
    bytes.push(b'\n');
    write_atomic(&state_path(run_dir), &bytes).map_err(|e| OrchError::state(format!("cannot persist state: {e}")))
}

pub fn load_state(run_dir: &Path) -> OrchResult<RunState> {
    use std::io::Read;
    let path = state_path(run_dir);
    let mut file = guarded_open_read(&path).map_err(|e| OrchError::state(format!("cannot open state: {e}")))?;
    let mut text = String::new();
    file.read_to_string(&mut text).map_err(|e| OrchError::state(format!("cannot read state: {e}")))?;

    let state: RunState = serde_json::from_str(&text).map_err(|e| OrchError::state(format!("invalid state field: {e}")))?;
    validate_run_state(&state).map_err(|e| OrchError::state(e.to_string()))?;
    Ok(state)
}

//! Server feature detection.
//!
//! Walks its own small machine, fetching only the grids a given feature
//! set needs. Plain feature names are compared against the server's `ops`
//! grid; extension features (names containing `/`) have no generic
//! detection and report as unsupported.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::core::{ContractError, Error, OpHandle, StateMachine};
use crate::grid::{Grid, Scalar};
use crate::session::SessionInner;

use super::grid::{GridOp, GridPayload};

/// Feature name to supported flag, in query order.
pub type FeatureMap = IndexMap<String, bool>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FeatureState {
    Init,
    GetAbout,
    GetFormats,
    GetOps,
    CheckFeatures,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FeatureEvent {
    Go,
    AboutDone,
    FormatsDone,
    OpsDone,
    Checked,
    Exception,
}

fn feature_machine() -> Result<StateMachine<FeatureState, FeatureEvent>, ContractError> {
    use FeatureEvent as E;
    use FeatureState as S;
    StateMachine::new(
        S::Init,
        &[S::Done],
        &[
            // Event             Current state           New state
            (E::Go, Some(S::Init), S::GetAbout),
            (E::AboutDone, Some(S::GetAbout), S::GetFormats),
            (E::FormatsDone, Some(S::GetFormats), S::GetOps),
            (E::OpsDone, Some(S::GetOps), S::CheckFeatures),
            (E::Checked, Some(S::CheckFeatures), S::Done),
            (E::Exception, None, S::Done),
        ],
    )
}

pub(crate) fn spawn(session: Arc<SessionInner>, features: Vec<String>) -> OpHandle<FeatureMap> {
    let handle = OpHandle::new();
    let driver_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = drive(&session, &driver_handle, features).await {
            driver_handle.complete(Err(err));
        }
    });
    handle
}

async fn drive(
    session: &Arc<SessionInner>,
    handle: &OpHandle<FeatureMap>,
    features: Vec<String>,
) -> Result<(), Error> {
    let mut machine = feature_machine()?;
    // Plain names are answered by the ops grid alone; the about and
    // formats grids are only needed by vendor-specific checks.
    let need_ops = features.iter().any(|f| !f.contains('/'));
    let mut ops_grid: Option<Grid> = None;
    let mut checked: Option<FeatureMap> = None;
    let mut failure: Option<Error> = None;

    loop {
        match machine.current() {
            FeatureState::Init => {
                tracing::debug!(count = features.len(), need_ops, "checking features");
                machine.fire(FeatureEvent::Go)?;
            }
            FeatureState::GetAbout => {
                machine.fire(FeatureEvent::AboutDone)?;
            }
            FeatureState::GetFormats => {
                machine.fire(FeatureEvent::FormatsDone)?;
            }
            FeatureState::GetOps => {
                if need_ops {
                    let op = GridOp::get(Arc::clone(session), "ops", Vec::new())
                        .cached()
                        .spawn();
                    op.done().await;
                    match op.result().and_then(GridPayload::into_single) {
                        Ok(grid) => {
                            ops_grid = Some(grid);
                            machine.fire(FeatureEvent::OpsDone)?;
                        }
                        Err(e) => {
                            failure = Some(e);
                            machine.fire(FeatureEvent::Exception)?;
                        }
                    }
                } else {
                    machine.fire(FeatureEvent::OpsDone)?;
                }
            }
            FeatureState::CheckFeatures => {
                checked = Some(check_features(&features, ops_grid.as_ref()));
                machine.fire(FeatureEvent::Checked)?;
            }
            FeatureState::Done => {
                let result = match failure.take() {
                    Some(err) => Err(err),
                    None => checked
                        .take()
                        .ok_or(ContractError::NotReady)
                        .map_err(Error::from),
                };
                handle.complete(result);
                return Ok(());
            }
        }
    }
}

fn check_features(features: &[String], ops_grid: Option<&Grid>) -> FeatureMap {
    let op_names: Vec<&str> = ops_grid
        .map(|grid| {
            grid.rows()
                .filter_map(|row| match row.get("name") {
                    Some(Scalar::Str(name)) => Some(name.as_str()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    features
        .iter()
        .map(|feature| {
            let supported = !feature.contains('/') && op_names.contains(&feature.as_str());
            (feature.clone(), supported)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Row;

    fn ops_grid(names: &[&str]) -> Grid {
        let mut grid = Grid::new();
        for name in names {
            let mut row = Row::new();
            row.insert("name".to_string(), Scalar::str(*name));
            grid.push_row(row);
        }
        grid
    }

    #[test]
    fn plain_features_match_op_names() {
        let grid = ops_grid(&["about", "read", "hisRead"]);
        let features = vec!["hisRead".to_string(), "hisWrite".to_string()];
        let result = check_features(&features, Some(&grid));
        assert_eq!(result["hisRead"], true);
        assert_eq!(result["hisWrite"], false);
    }

    #[test]
    fn extension_features_report_unsupported() {
        let grid = ops_grid(&["hisRead"]);
        let features = vec!["hisRead/multi".to_string()];
        let result = check_features(&features, Some(&grid));
        assert_eq!(result["hisRead/multi"], false);
    }

    #[test]
    fn machine_reaches_done_through_all_steps() {
        let mut m = feature_machine().unwrap();
        for event in [
            FeatureEvent::Go,
            FeatureEvent::AboutDone,
            FeatureEvent::FormatsDone,
            FeatureEvent::OpsDone,
            FeatureEvent::Checked,
        ] {
            m.fire(event).unwrap();
        }
        assert!(m.is_finished());
    }
}

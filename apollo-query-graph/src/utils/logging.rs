/// Emits a `trace!` event tagged with a `snapshot` kind and its `data`, so that tooling can replay
/// how paths, path trees and open branches change during a traversal. Compiled out unless the
/// `snapshot_tracing` feature is on.
///
/// Given a serializable value, the tag is its type name and the data its JSON:
/// ```ignore
/// snapshot!(statistics, "planning statistics");
/// // Generates:
/// // trace!(snapshot = "QueryPlanningStatistics", data = "{ .. }", "planning statistics");
/// ```
/// Otherwise pass the tag and a `tracing::Value`, usually a rendered string:
/// ```ignore
/// snapshot!("OpPathTree", path_tree.to_string(), "merged path tree");
/// // Generates:
/// // trace!(snapshot = "OpPathTree", data = path_tree.to_string(), "merged path tree");
/// ```
macro_rules! snapshot {
    ($value:expr, $msg:literal) => {
        #[cfg(feature = "snapshot_tracing")]
        tracing::trace!(
            snapshot = std::any::type_name_of_val(&$value),
            data = serde_json::to_string(&$value).unwrap_or_default(),
            $msg
        );
    };
    ($name:literal, $value:expr, $msg:literal) => {
        #[cfg(feature = "snapshot_tracing")]
        tracing::trace!(snapshot = $name, data = $value, $msg);
    };
}

pub(crate) use snapshot;

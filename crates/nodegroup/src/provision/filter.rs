use glob::Pattern;

use crate::{Error, Result, api::NodeGroup};

/// Keep the nodegroups whose name matches any of the comma separated globs.
///
/// An empty expression keeps everything. A non-empty expression that matches
/// nothing is an error.
pub fn filter_node_groups(expr: &str, node_groups: Vec<NodeGroup>) -> Result<Vec<NodeGroup>> {
    if expr.is_empty() {
        return Ok(node_groups);
    }

    let patterns = expr
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| Error::validation(format!("invalid nodegroup filter {p:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let filtered: Vec<_> = node_groups
        .into_iter()
        .filter(|ng| patterns.iter().any(|p| p.matches(&ng.name)))
        .collect();

    if filtered.is_empty() {
        return Err(Error::validation(format!(
            "no nodegroups match filter specification: {expr}"
        )));
    }

    tracing::info!(
        "{} nodegroup(s) selected by filter {expr:?}: {}",
        filtered.len(),
        filtered
            .iter()
            .map(|ng| ng.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(names: &[&str]) -> Vec<NodeGroup> {
        names
            .iter()
            .map(|name| NodeGroup {
                name: name.to_string(),
                ..Default::default()
            })
            .collect()
    }

    fn names(node_groups: &[NodeGroup]) -> Vec<&str> {
        node_groups.iter().map(|ng| ng.name.as_str()).collect()
    }

    #[test]
    fn empty_expression_keeps_everything() {
        let kept = filter_node_groups("", units(&["a1", "b1"])).unwrap();
        assert_eq!(names(&kept), vec!["a1", "b1"]);
    }

    #[test]
    fn keeps_matches_in_input_order() {
        let kept = filter_node_groups("a*", units(&["a1", "b1", "a2"])).unwrap();
        assert_eq!(names(&kept), vec!["a1", "a2"]);
    }

    #[test]
    fn patterns_are_alternatives() {
        let kept = filter_node_groups("b?,a2", units(&["a1", "a2", "b1", "bb1"])).unwrap();
        assert_eq!(names(&kept), vec!["a2", "b1"]);
    }

    #[test]
    fn no_match_is_an_error() {
        let err = filter_node_groups("z*", units(&["a1", "a2", "b1"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no nodegroups match filter specification: z*"
        );
    }

    #[test]
    fn invalid_glob_is_an_error() {
        let err = filter_node_groups("[a", units(&["a1"])).unwrap_err();
        assert!(err.to_string().contains("invalid nodegroup filter"));
    }
}

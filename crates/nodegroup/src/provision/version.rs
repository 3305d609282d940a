use serde::Serialize;

use crate::{
    Error, Result,
    api::{AUTO_VERSION, ClusterMeta, LATEST_VERSION, LATEST_VERSION_ALIAS, SUPPORTED_VERSIONS},
    cluster::ControlPlane,
};

use super::source::ConfigSource;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionRequest {
    Auto,
    Latest,
    Explicit(String),
}

impl VersionRequest {
    pub fn parse(version: &str) -> Result<Self> {
        match version {
            "" | AUTO_VERSION => Ok(Self::Auto),
            LATEST_VERSION_ALIAS => Ok(Self::Latest),
            v if SUPPORTED_VERSIONS.contains(&v) => Ok(Self::Explicit(v.to_string())),
            v => Err(Error::validation(format!(
                "invalid version {v}, supported values: {AUTO_VERSION}, {LATEST_VERSION_ALIAS}, {}",
                SUPPORTED_VERSIONS.join(", ")
            ))),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum DispositionKind {
    AutoInherited,
    LatestForced,
    ExplicitConfirmed,
    ExplicitMismatched { control_plane: String },
}

/// Concrete version for new nodegroups and how it was arrived at
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct VersionDisposition {
    pub version: String,
    #[serde(flatten)]
    pub kind: DispositionKind,
}

impl VersionDisposition {
    /// Warning for a version that differs from the control plane, phrased for `source`
    pub fn mismatch_warning(&self, control_plane: &str, source: &ConfigSource) -> Option<String> {
        if self.kind == DispositionKind::AutoInherited || self.version == control_plane {
            return None;
        }
        Some(format!(
            "will use version {} for new nodegroup(s), while control plane version is \
             {control_plane}; to automatically inherit the version use {:?}",
            self.version,
            source.version_hint()
        ))
    }
}

/// Settle the requested version against the live control plane version
pub fn decide(request: &VersionRequest, control_plane: &str) -> VersionDisposition {
    let (version, kind) = match request {
        VersionRequest::Auto => (control_plane.to_string(), DispositionKind::AutoInherited),
        VersionRequest::Latest => (LATEST_VERSION.to_string(), DispositionKind::LatestForced),
        VersionRequest::Explicit(v) if v == control_plane => {
            (v.clone(), DispositionKind::ExplicitConfirmed)
        }
        VersionRequest::Explicit(v) => (
            v.clone(),
            DispositionKind::ExplicitMismatched {
                control_plane: control_plane.to_string(),
            },
        ),
    };
    VersionDisposition { version, kind }
}

/// Replace the symbolic version in `meta` with a concrete one.
///
/// Fails on unsupported versions and when the control plane can't be queried;
/// a mismatch with the control plane only produces a warning.
pub async fn reconcile(
    meta: &mut ClusterMeta,
    control_plane: &dyn ControlPlane,
    source: &ConfigSource,
) -> Result<VersionDisposition> {
    let request = VersionRequest::parse(&meta.version)?;

    if request == VersionRequest::Latest {
        tracing::info!("will use latest version ({LATEST_VERSION}) for new nodegroup(s)");
    }

    let live = match control_plane.current_version().await {
        Ok(v) if !v.is_empty() => v,
        Ok(_) => return Err(Error::connectivity("unable to get control plane version")),
        Err(e @ Error::Connectivity(_)) => return Err(e),
        Err(e) => {
            return Err(Error::connectivity(format!(
                "unable to get control plane version: {e}"
            )));
        }
    };

    let disposition = decide(&request, &live);
    if disposition.kind == DispositionKind::AutoInherited {
        tracing::info!(
            "will use version {} for new nodegroup(s) based on control plane version",
            disposition.version
        );
    }
    if let Some(warning) = disposition.mismatch_warning(&live, source) {
        tracing::warn!("{warning}");
    }

    meta.version = disposition.version.clone();
    Ok(disposition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockControlPlane;

    fn control_plane(version: &'static str) -> MockControlPlane {
        let mut cp = MockControlPlane::new();
        cp.expect_current_version()
            .returning(move || Ok(version.to_string()));
        cp
    }

    fn meta(version: &str) -> ClusterMeta {
        ClusterMeta {
            name: "prod".to_string(),
            region: "us-west-2".to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn parses_requests() {
        assert_eq!(VersionRequest::parse("").unwrap(), VersionRequest::Auto);
        assert_eq!(VersionRequest::parse("auto").unwrap(), VersionRequest::Auto);
        assert_eq!(VersionRequest::parse("latest").unwrap(), VersionRequest::Latest);
        assert_eq!(
            VersionRequest::parse("1.13").unwrap(),
            VersionRequest::Explicit("1.13".to_string())
        );

        let err = VersionRequest::parse("9.99").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid version 9.99, supported values: auto, latest, 1.12, 1.13, 1.14"
        );
    }

    #[tokio::test]
    async fn auto_inherits_control_plane_version() {
        let mut meta = meta("auto");
        let disposition = reconcile(&mut meta, &control_plane("1.14"), &ConfigSource::Flags)
            .await
            .unwrap();

        assert_eq!(disposition.version, "1.14");
        assert_eq!(disposition.kind, DispositionKind::AutoInherited);
        assert_eq!(meta.version, "1.14");
    }

    #[tokio::test]
    async fn explicit_mismatch_proceeds() {
        let mut meta = meta("1.13");
        let disposition = reconcile(&mut meta, &control_plane("1.14"), &ConfigSource::Flags)
            .await
            .unwrap();

        assert_eq!(disposition.version, "1.13");
        assert_eq!(
            disposition.kind,
            DispositionKind::ExplicitMismatched {
                control_plane: "1.14".to_string()
            }
        );
    }

    #[test]
    fn mismatch_warning_names_the_hint_for_each_source() {
        let disposition = decide(&VersionRequest::Explicit("1.13".to_string()), "1.14");

        assert_eq!(
            disposition.mismatch_warning("1.14", &ConfigSource::Flags).unwrap(),
            "will use version 1.13 for new nodegroup(s), while control plane version is 1.14; \
             to automatically inherit the version use \"--version=auto\""
        );
        let document = ConfigSource::Document("cluster.yaml".into());
        assert!(
            disposition
                .mismatch_warning("1.14", &document)
                .unwrap()
                .ends_with("use \"metadata.version: auto\"")
        );
    }

    #[test]
    fn no_mismatch_warning_when_versions_agree() {
        let document = ConfigSource::Document("cluster.yaml".into());
        for (request, control_plane) in [
            (VersionRequest::Auto, "1.13"),
            (VersionRequest::Explicit("1.14".to_string()), "1.14"),
            (VersionRequest::Latest, LATEST_VERSION),
        ] {
            let disposition = decide(&request, control_plane);
            assert_eq!(disposition.mismatch_warning(control_plane, &ConfigSource::Flags), None);
            assert_eq!(disposition.mismatch_warning(control_plane, &document), None);
        }

        let forced = decide(&VersionRequest::Latest, "1.12");
        assert!(forced.mismatch_warning("1.12", &document).is_some());
    }

    #[tokio::test]
    async fn explicit_match_is_confirmed() {
        let mut meta = meta("1.14");
        let disposition = reconcile(&mut meta, &control_plane("1.14"), &ConfigSource::Flags)
            .await
            .unwrap();
        assert_eq!(disposition.kind, DispositionKind::ExplicitConfirmed);
    }

    #[tokio::test]
    async fn latest_is_forced() {
        let mut meta = meta("latest");
        let disposition = reconcile(&mut meta, &control_plane("1.13"), &ConfigSource::Flags)
            .await
            .unwrap();
        assert_eq!(disposition.version, LATEST_VERSION);
        assert_eq!(disposition.kind, DispositionKind::LatestForced);
    }

    #[tokio::test]
    async fn unsupported_version_aborts_before_query() {
        let mut cp = MockControlPlane::new();
        cp.expect_current_version().never();

        let err = reconcile(&mut meta("9.99"), &cp, &ConfigSource::Flags)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn unreachable_control_plane_aborts() {
        let mut cp = MockControlPlane::new();
        cp.expect_current_version()
            .returning(|| Err(Error::Io(std::io::Error::other("connection refused"))));

        let err = reconcile(&mut meta("auto"), &cp, &ConfigSource::Flags)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
        assert!(err.to_string().contains("connection refused"));
    }
}

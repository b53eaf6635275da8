//! The migration registry: every known change unit, totally ordered.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::change::ChangeUnit;
use crate::error::{MigrateResult, MigrationError};

/// All registered change units, keyed by version.
///
/// Built once at process start, before any runner activity; there is no
/// dynamic registration during a run. Version numbering gaps are normal -
/// retired numbers stay occupied by their (possibly no-op) units and are
/// never reused.
#[derive(Default)]
pub struct MigrationRegistry {
    units: BTreeMap<i64, Arc<dyn ChangeUnit>>,
}

impl MigrationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a compiled-in list of units.
    pub fn from_units(
        units: impl IntoIterator<Item = Arc<dyn ChangeUnit>>,
    ) -> MigrateResult<Self> {
        let mut registry = Self::new();
        for unit in units {
            registry.register(unit)?;
        }
        Ok(registry)
    }

    /// Register a change unit. Versions are positive integers; zero and
    /// negative versions are rejected (the revert target 0 means "revert
    /// everything"). Fails with [`MigrationError::DuplicateVersion`] if the
    /// version is already taken.
    pub fn register(&mut self, unit: Arc<dyn ChangeUnit>) -> MigrateResult<()> {
        let version = unit.version();
        if version < 1 {
            return Err(MigrationError::config(format!(
                "version {version} of unit '{}' is not a positive integer",
                unit.name()
            )));
        }
        if let Some(existing) = self.units.get(&version) {
            return Err(MigrationError::DuplicateVersion {
                version,
                existing: existing.name().to_string(),
                duplicate: unit.name().to_string(),
            });
        }
        self.units.insert(version, unit);
        Ok(())
    }

    /// All known versions, ascending. Stable once registration is complete.
    pub fn ordered_versions(&self) -> Vec<i64> {
        self.units.keys().copied().collect()
    }

    /// Look up the unit for a version.
    pub fn lookup(&self, version: i64) -> MigrateResult<&Arc<dyn ChangeUnit>> {
        self.units
            .get(&version)
            .ok_or(MigrationError::UnknownVersion(version))
    }

    /// The highest registered version, if any.
    pub fn latest_version(&self) -> Option<i64> {
        self.units.keys().next_back().copied()
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::MigrationCtx;
    use async_trait::async_trait;

    struct Noop {
        version: i64,
        name: &'static str,
    }

    #[async_trait]
    impl ChangeUnit for Noop {
        fn version(&self) -> i64 {
            self.version
        }

        fn name(&self) -> &str {
            self.name
        }

        async fn up(&self, _ctx: &MigrationCtx<'_>) -> MigrateResult<()> {
            Ok(())
        }

        async fn down(&self, _ctx: &MigrationCtx<'_>) -> MigrateResult<()> {
            Ok(())
        }
    }

    fn unit(version: i64, name: &'static str) -> Arc<dyn ChangeUnit> {
        Arc::new(Noop { version, name })
    }

    #[test]
    fn test_ordered_versions_strictly_increasing_with_gaps() {
        let registry =
            MigrationRegistry::from_units([unit(7, "c"), unit(2, "a"), unit(5, "b")]).unwrap();
        let versions = registry.ordered_versions();
        assert_eq!(versions, vec![2, 5, 7]);
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(registry.latest_version(), Some(7));
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut registry = MigrationRegistry::new();
        registry.register(unit(3, "first")).unwrap();
        let err = registry.register(unit(3, "second")).unwrap_err();
        match err {
            MigrationError::DuplicateVersion {
                version,
                existing,
                duplicate,
            } => {
                assert_eq!(version, 3);
                assert_eq!(existing, "first");
                assert_eq!(duplicate, "second");
            }
            other => panic!("expected DuplicateVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_non_positive_versions_rejected() {
        let mut registry = MigrationRegistry::new();
        assert!(matches!(
            registry.register(unit(0, "zero")),
            Err(MigrationError::Config(_))
        ));
        assert!(matches!(
            registry.register(unit(-3, "negative")),
            Err(MigrationError::Config(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_unknown_version() {
        let registry = MigrationRegistry::from_units([unit(1, "only")]).unwrap();
        assert!(registry.lookup(1).is_ok());
        assert!(matches!(
            registry.lookup(99),
            Err(MigrationError::UnknownVersion(99))
        ));
    }
}

//! Static permission → role bundle table.
//!
//! A missing permission is closed by granting the one bundle mapped to it.
//! Several mappings are broader than strictly needed (the brand permissions
//! only come with `roles/editor`); pass a custom table to narrow them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use warden_core::{MissingSet, PermissionId, RoleBundle};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleTable {
    map: BTreeMap<PermissionId, RoleBundle>,
}

static DEFAULT_GCP: LazyLock<RoleTable> = LazyLock::new(|| {
    RoleTable::from_pairs(&[
        // ── Organization policy ──────────────────────────────
        ("orgpolicy.policy.get", "roles/orgpolicy.policyAdmin"),
        ("orgpolicy.policy.set", "roles/orgpolicy.policyAdmin"),
        // ── Resource manager ─────────────────────────────────
        ("resourcemanager.organizations.get", "roles/resourcemanager.organizationViewer"),
        ("resourcemanager.projects.create", "roles/resourcemanager.projectCreator"),
        ("resourcemanager.projects.get", "roles/browser"),
        // ── Service usage ────────────────────────────────────
        ("serviceusage.services.enable", "roles/serviceusage.serviceUsageAdmin"),
        ("serviceusage.services.list", "roles/serviceusage.serviceUsageAdmin"),
        // ── IAP brands ───────────────────────────────────────
        ("iap.brands.create", "roles/editor"),
        ("iap.brands.list", "roles/editor"),
        // ── IAM OAuth clients ────────────────────────────────
        ("iam.oauthClients.create", "roles/iam.oauthClientAdmin"),
        ("iam.oauthClients.update", "roles/iam.oauthClientAdmin"),
        ("iam.oauthClientCredentials.create", "roles/iam.oauthClientAdmin"),
        ("iam.oauthClientCredentials.delete", "roles/iam.oauthClientAdmin"),
        ("iam.oauthClientCredentials.list", "roles/iam.oauthClientAdmin"),
    ])
});

impl RoleTable {
    /// The table used when none is configured.
    pub fn default_gcp() -> &'static RoleTable {
        &DEFAULT_GCP
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            map: pairs
                .iter()
                .map(|(perm, role)| (PermissionId::from(*perm), RoleBundle::new(*role)))
                .collect(),
        }
    }

    pub fn bundle_for(&self, permission: &PermissionId) -> Option<&RoleBundle> {
        self.map.get(permission)
    }

    /// Bundles covering `missing`, plus the permissions no bundle covers.
    pub fn cover(&self, missing: &MissingSet) -> (BTreeSet<RoleBundle>, Vec<PermissionId>) {
        let mut bundles = BTreeSet::new();
        let mut uncovered = Vec::new();
        for permission in missing {
            match self.map.get(permission) {
                Some(bundle) => {
                    bundles.insert(bundle.clone());
                }
                None => uncovered.push(permission.clone()),
            }
        }
        (bundles, uncovered)
    }

    /// Inverted view: each bundle with the permissions it is known to carry.
    pub fn catalog(&self) -> BTreeMap<RoleBundle, BTreeSet<PermissionId>> {
        let mut out: BTreeMap<RoleBundle, BTreeSet<PermissionId>> = BTreeMap::new();
        for (permission, bundle) in &self.map {
            out.entry(bundle.clone()).or_default().insert(permission.clone());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_covers_every_default_permission() {
        let table = RoleTable::default_gcp();
        assert_eq!(table.len(), 14);
        assert_eq!(
            table.bundle_for(&"iap.brands.create".into()),
            Some(&RoleBundle::new("roles/editor"))
        );
    }

    #[test]
    fn cover_deduplicates_bundles_and_reports_gaps() {
        let table = RoleTable::from_pairs(&[("a.b.c", "roles/x"), ("a.b.d", "roles/x")]);
        let missing: MissingSet = ["a.b.c", "a.b.d", "z.z.z"].into_iter().map(PermissionId::from).collect();

        let (bundles, uncovered) = table.cover(&missing);
        assert_eq!(bundles, BTreeSet::from([RoleBundle::new("roles/x")]));
        assert_eq!(uncovered, vec![PermissionId::from("z.z.z")]);
    }

    #[test]
    fn catalog_inverts_the_table() {
        let catalog = RoleTable::default_gcp().catalog();
        let admin = &catalog[&RoleBundle::new("roles/iam.oauthClientAdmin")];
        assert_eq!(admin.len(), 5);
        assert!(admin.contains(&PermissionId::from("iam.oauthClients.create")));
    }
}

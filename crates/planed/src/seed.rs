//! Catalog seeding from a JSON document

use anyhow::{Context, Result};
use plane_lib::catalog::{CatalogEntity, MemoryCatalog};
use std::path::Path;
use tracing::info;

/// Parse a JSON array of tagged catalog entities
pub fn parse(document: &str) -> Result<Vec<CatalogEntity>> {
    serde_json::from_str(document).context("catalog seed is not a list of entities")
}

/// Load entities from `path` into the catalog, returning how many were applied
pub fn load_into(catalog: &MemoryCatalog, path: &Path) -> Result<usize> {
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog seed {}", path.display()))?;
    let entities = parse(&document)?;
    let count = entities.len();
    for entity in entities {
        catalog.upsert(entity);
    }
    info!(path = %path.display(), entities = count, "Catalog seeded");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plane_lib::catalog::SiteGetter;

    #[tokio::test]
    async fn test_seed_document() {
        let entities = parse(
            r#"[
                {"kind": "site", "id": "s1", "name": "east", "domain": "k8s.east", "port": 6443}
            ]"#,
        )
        .unwrap();
        assert_eq!(entities.len(), 1);

        let catalog = MemoryCatalog::with_entities(entities);
        let site = catalog.get_site("s1").await.unwrap();
        assert_eq!(site.name, "east");
        assert!(site.enabled);
    }

    #[test]
    fn test_rejects_non_list() {
        assert!(parse(r#"{"kind": "site"}"#).is_err());
    }
}

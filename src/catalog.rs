use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::error::AppError;
use crate::foundry::FoundryClient;
use crate::models::{BaselineMatch, CatalogItem, DesignSpec};

const IMAGE_EXTS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Ordered accepted aliases per canonical column; the first
/// present-and-non-empty alias wins. Provider responses and older metadata
/// blobs do not agree on key spellings.
const PRODUCT_TYPE_ALIASES: [&str; 4] = ["product_type", "type", "packaging_type", "product"];
const MATERIAL_ALIASES: [&str; 3] = ["material", "intended_material", "material_type"];
const CLOSURE_ALIASES: [&str; 4] = ["closure_type", "closure", "cap_type", "lid_type"];
const STYLE_ALIASES: [&str; 3] = ["design_style", "style", "visual_style"];
const SIZE_ALIASES: [&str; 4] = ["size_or_volume", "size", "volume", "capacity"];
const TAGS_ALIASES: [&str; 3] = ["tags", "keywords", "tag_list"];
const SUMMARY_ALIASES: [&str; 3] = ["summary", "description", "meta_description"];

fn pick_alias(metadata: &Value, aliases: &[&str]) -> Option<String> {
    for key in aliases {
        match metadata.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Null) | None => continue,
            Some(other) if !other.is_null() => {
                let txt = other.to_string();
                if !txt.is_empty() && txt != "\"\"" {
                    return Some(txt);
                }
            }
            _ => continue,
        }
    }
    None
}

fn pick_tags(metadata: &Value) -> String {
    for key in TAGS_ALIASES {
        match metadata.get(key) {
            Some(Value::Array(items)) => {
                let joined = items
                    .iter()
                    .filter_map(|t| match t {
                        Value::String(s) => Some(s.trim().to_string()),
                        other => Some(other.to_string()),
                    })
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join(", ");
                if !joined.is_empty() {
                    return joined;
                }
            }
            Some(Value::String(s)) if !s.trim().is_empty() => return s.trim().to_string(),
            _ => continue,
        }
    }
    String::new()
}

/// Metadata store over catalog images plus the deterministic baseline
/// matcher. One row per asset, keyed by absolute path.
pub struct AssetCatalog {
    conn: Mutex<Connection>,
    assets_dir: PathBuf,
}

impl AssetCatalog {
    pub fn new(db_path: &str, assets_dir: &str) -> Result<Self, AppError> {
        let assets_dir = PathBuf::from(assets_dir);
        fs::create_dir_all(&assets_dir)?;
        let conn = Connection::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS asset_metadata (
                asset_path TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                product_type TEXT,
                material TEXT,
                closure_type TEXT,
                design_style TEXT,
                size_or_volume TEXT,
                tags TEXT,
                summary TEXT,
                metadata_json TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn), assets_dir })
    }

    /// Every image file under the assets directory, sorted for determinism.
    pub fn list_assets(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        collect_images(&self.assets_dir, &mut files);
        files.sort();
        files
    }

    /// Enumerates assets, prunes rows whose backing file is gone, and
    /// describes files lacking usable metadata through the vision provider.
    /// Upserts are idempotent; returns (indexed, total).
    pub async fn index_assets(
        &self,
        foundry: &FoundryClient,
        force_reindex: bool,
        api_key_override: Option<&str>,
    ) -> Result<(usize, usize), AppError> {
        let assets = self.list_assets();
        let pruned = self.prune_missing(&assets)?;
        if pruned > 0 {
            info!(pruned, "pruned deleted asset metadata rows");
        }
        let mut indexed = 0;
        for asset in &assets {
            if !force_reindex && self.has_usable_metadata(asset)? {
                continue;
            }
            let metadata = foundry.describe_packaging_asset(asset, api_key_override).await;
            self.upsert_metadata(asset, &metadata)?;
            indexed += 1;
        }
        Ok((indexed, assets.len()))
    }

    /// Deletes rows whose asset file no longer exists on disk. Paths are
    /// compared resolved; unresolvable rows fall back to an existence check.
    pub fn prune_missing(&self, existing: &[PathBuf]) -> Result<usize, AppError> {
        let existing_resolved: Vec<String> = existing
            .iter()
            .map(|p| {
                fs::canonicalize(p)
                    .map(|c| c.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| p.to_string_lossy().into_owned())
            })
            .collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT asset_path FROM asset_metadata")?;
        let paths: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut stale = Vec::new();
        for raw in paths {
            let resolved = fs::canonicalize(&raw)
                .map(|c| c.to_string_lossy().into_owned())
                .unwrap_or_else(|_| raw.clone());
            if !existing_resolved.contains(&resolved) && !Path::new(&raw).is_file() {
                stale.push(raw);
            }
        }
        for path in &stale {
            conn.execute("DELETE FROM asset_metadata WHERE asset_path = ?1", params![path])?;
        }
        Ok(stale.len())
    }

    fn has_usable_metadata(&self, asset: &Path) -> Result<bool, AppError> {
        let key = asset.to_string_lossy().into_owned();
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT metadata_json FROM asset_metadata WHERE asset_path = ?1",
                params![key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(raw) = raw else { return Ok(false) };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(!map.is_empty()),
            _ => Ok(false),
        }
    }

    /// Idempotent write of one catalog row; re-indexing the same file
    /// overwrites, never duplicates.
    pub fn upsert_metadata(&self, asset: &Path, metadata: &Value) -> Result<(), AppError> {
        let filename = asset
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO asset_metadata(
                asset_path, filename, product_type, material, closure_type, design_style,
                size_or_volume, tags, summary, metadata_json, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, CURRENT_TIMESTAMP)
            ON CONFLICT(asset_path) DO UPDATE SET
                filename=excluded.filename,
                product_type=excluded.product_type,
                material=excluded.material,
                closure_type=excluded.closure_type,
                design_style=excluded.design_style,
                size_or_volume=excluded.size_or_volume,
                tags=excluded.tags,
                summary=excluded.summary,
                metadata_json=excluded.metadata_json,
                updated_at=CURRENT_TIMESTAMP",
            params![
                asset.to_string_lossy().into_owned(),
                filename,
                pick_alias(metadata, &PRODUCT_TYPE_ALIASES),
                pick_alias(metadata, &MATERIAL_ALIASES),
                pick_alias(metadata, &CLOSURE_ALIASES),
                pick_alias(metadata, &STYLE_ALIASES),
                pick_alias(metadata, &SIZE_ALIASES),
                pick_tags(metadata),
                pick_alias(metadata, &SUMMARY_ALIASES),
                serde_json::to_string(metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn metadata_count(&self) -> Result<usize, AppError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM asset_metadata", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Ranked candidates for a spec. A row qualifies at `total >= min_score`;
    /// qualifying rows sort by score descending with ties keeping catalog
    /// order, truncated to `limit`.
    pub fn find_matches(
        &self,
        spec: &DesignSpec,
        min_score: i64,
        limit: usize,
    ) -> Result<Vec<BaselineMatch>, AppError> {
        let rows = self.all_rows()?;
        let mut scored: Vec<(i64, CatalogRow)> = rows
            .into_iter()
            .filter_map(|row| {
                let score = score_row(spec, &row);
                (score >= min_score).then_some((score, row))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, row)| BaselineMatch {
                asset_rel_path: self.relative_asset_path(&row.asset_path),
                asset_path: row.asset_path,
                filename: row.filename,
                product_type: row.product_type,
                material: row.material,
                closure_type: row.closure_type,
                design_style: row.design_style,
                size_or_volume: row.size_or_volume,
                summary: row.summary,
                tags: row.tags,
                score,
            })
            .collect())
    }

    pub fn find_best_match(&self, spec: &DesignSpec) -> Result<Option<BaselineMatch>, AppError> {
        Ok(self.find_matches(spec, 2, 1)?.into_iter().next())
    }

    /// Catalog browse listing, newest rows first.
    pub fn list_catalog(&self, limit: usize) -> Result<Vec<CatalogItem>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT asset_path, filename, product_type, material, closure_type, design_style,
                    size_or_volume, tags, summary, metadata_json, updated_at
             FROM asset_metadata
             ORDER BY updated_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;
        let mut items = Vec::new();
        for row in rows {
            let (
                asset_path,
                filename,
                product_type,
                material,
                closure_type,
                design_style,
                size_or_volume,
                tags,
                summary,
                metadata_json,
                updated_at,
            ) = row?;
            let metadata = serde_json::from_str::<Value>(&metadata_json)
                .ok()
                .filter(Value::is_object);
            items.push(CatalogItem {
                asset_rel_path: self.relative_asset_path(&asset_path),
                filename,
                product_type,
                material,
                closure_type,
                design_style,
                size_or_volume,
                tags,
                summary,
                metadata_json: metadata,
                updated_at,
            });
        }
        Ok(items)
    }

    fn all_rows(&self) -> Result<Vec<CatalogRow>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT asset_path, filename, product_type, material, closure_type, design_style,
                    size_or_volume, tags, summary
             FROM asset_metadata
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CatalogRow {
                asset_path: row.get(0)?,
                filename: row.get(1)?,
                product_type: row.get(2)?,
                material: row.get(3)?,
                closure_type: row.get(4)?,
                design_style: row.get(5)?,
                size_or_volume: row.get(6)?,
                tags: row.get(7)?,
                summary: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn relative_asset_path(&self, raw_path: &str) -> String {
        let resolved = fs::canonicalize(raw_path).unwrap_or_else(|_| PathBuf::from(raw_path));
        let base = fs::canonicalize(&self.assets_dir).unwrap_or_else(|_| self.assets_dir.clone());
        match resolved.strip_prefix(&base) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| raw_path.to_string()),
        }
    }
}

struct CatalogRow {
    asset_path: String,
    filename: String,
    product_type: Option<String>,
    material: Option<String>,
    closure_type: Option<String>,
    design_style: Option<String>,
    size_or_volume: Option<String>,
    tags: Option<String>,
    summary: Option<String>,
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_images(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTS.contains(&e.to_lowercase().as_str()))
        {
            out.push(path);
        }
    }
}

fn field_score(spec_value: &Option<String>, row_value: &Option<String>, weight: i64) -> i64 {
    match (spec_value, row_value) {
        // Substring containment: free-text-derived vocabularies drift
        // ("jar" must still hit "cosmetic_jar").
        (Some(s), Some(r)) if !s.is_empty() && r.contains(s.as_str()) => weight,
        _ => 0,
    }
}

fn score_row(spec: &DesignSpec, row: &CatalogRow) -> i64 {
    field_score(&spec.product_type, &row.product_type, 4)
        + field_score(&spec.intended_material, &row.material, 3)
        + field_score(&spec.closure_type, &row.closure_type, 3)
        + field_score(&spec.design_style, &row.design_style, 2)
        + field_score(&spec.size_or_volume, &row.size_or_volume, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn catalog(tmp: &TempDir) -> AssetCatalog {
        let db = tmp.path().join("test.db");
        let assets = tmp.path().join("assets");
        AssetCatalog::new(db.to_str().unwrap(), assets.to_str().unwrap()).unwrap()
    }

    fn insert(catalog: &AssetCatalog, name: &str, metadata: Value) {
        let path = PathBuf::from("/virtual/assets").join(name);
        catalog.upsert_metadata(&path, &metadata).unwrap();
    }

    fn jar_glass_spec() -> DesignSpec {
        DesignSpec {
            product_type: Some("jar".to_string()),
            intended_material: Some("glass".to_string()),
            ..DesignSpec::default()
        }
    }

    #[test]
    fn substring_scoring_matches_spec_scenario() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        insert(&cat, "a.png", json!({"product_type": "cosmetic_jar", "material": "glass"}));

        let matches = cat.find_matches(&jar_glass_spec(), 2, 5).unwrap();
        assert_eq!(matches.len(), 1);
        // product_type 4 ("jar" in "cosmetic_jar") + material 3.
        assert_eq!(matches[0].score, 7);
    }

    #[test]
    fn rows_below_min_score_are_excluded() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        insert(&cat, "a.png", json!({"size_or_volume": "50 ml"}));

        let spec = DesignSpec {
            size_or_volume: Some("50 ml".to_string()),
            ..DesignSpec::default()
        };
        // Only size matches: score 1 < min_score 2.
        assert!(cat.find_matches(&spec, 2, 5).unwrap().is_empty());
        assert_eq!(cat.find_matches(&spec, 1, 5).unwrap().len(), 1);
    }

    #[test]
    fn results_sorted_descending_and_truncated() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        insert(&cat, "weak.png", json!({"material": "glass"}));
        insert(
            &cat,
            "strong.png",
            json!({"product_type": "jar", "material": "glass", "design_style": "minimal"}),
        );
        insert(&cat, "mid.png", json!({"product_type": "jar"}));

        let mut spec = jar_glass_spec();
        spec.design_style = Some("minimal".to_string());

        let matches = cat.find_matches(&spec, 2, 5).unwrap();
        let scores: Vec<i64> = matches.iter().map(|m| m.score).collect();
        assert_eq!(scores, vec![9, 4, 3]);
        assert_eq!(matches[0].filename, "strong.png");

        let limited = cat.find_matches(&spec, 2, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn ties_keep_catalog_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        insert(&cat, "first.png", json!({"product_type": "jar"}));
        insert(&cat, "second.png", json!({"product_type": "jar"}));

        let spec = DesignSpec { product_type: Some("jar".to_string()), ..DesignSpec::default() };
        let matches = cat.find_matches(&spec, 2, 5).unwrap();
        assert_eq!(matches[0].filename, "first.png");
        assert_eq!(matches[1].filename, "second.png");
    }

    #[test]
    fn adding_a_matching_field_never_decreases_score() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        insert(&cat, "a.png", json!({"product_type": "jar", "material": "glass"}));

        let narrow = DesignSpec { product_type: Some("jar".to_string()), ..DesignSpec::default() };
        let wide = jar_glass_spec();

        let narrow_score = cat.find_matches(&narrow, 1, 5).unwrap()[0].score;
        let wide_score = cat.find_matches(&wide, 1, 5).unwrap()[0].score;
        assert!(wide_score >= narrow_score);
    }

    #[test]
    fn best_match_is_none_on_empty_catalog() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        assert!(cat.find_best_match(&jar_glass_spec()).unwrap().is_none());
    }

    #[test]
    fn upsert_is_idempotent_per_path() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        insert(&cat, "a.png", json!({"product_type": "jar"}));
        insert(&cat, "a.png", json!({"product_type": "bottle"}));

        assert_eq!(cat.metadata_count().unwrap(), 1);
        let spec = DesignSpec { product_type: Some("bottle".to_string()), ..DesignSpec::default() };
        assert_eq!(cat.find_matches(&spec, 2, 5).unwrap().len(), 1);
    }

    #[test]
    fn alias_keys_normalize_to_canonical_columns() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        insert(
            &cat,
            "a.png",
            json!({"type": "jar", "intended_material": "glass", "closure": "screw"}),
        );

        let mut spec = jar_glass_spec();
        spec.closure_type = Some("screw".to_string());
        let matches = cat.find_matches(&spec, 2, 5).unwrap();
        assert_eq!(matches[0].score, 10);
    }

    #[test]
    fn prune_removes_rows_for_missing_files() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        insert(&cat, "gone.png", json!({"product_type": "jar"}));

        // Row points at a file that does not exist; an empty on-disk set
        // must prune it.
        let removed = cat.prune_missing(&[]).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cat.metadata_count().unwrap(), 0);
    }

    #[test]
    fn prune_keeps_rows_for_existing_files() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        let on_disk = tmp.path().join("assets").join("real.png");
        std::fs::write(&on_disk, b"png").unwrap();
        cat.upsert_metadata(&on_disk, &json!({"product_type": "jar"})).unwrap();

        let removed = cat.prune_missing(&[on_disk]).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(cat.metadata_count().unwrap(), 1);
    }

    #[test]
    fn list_assets_finds_nested_images() {
        let tmp = TempDir::new().unwrap();
        let cat = catalog(&tmp);
        let nested = tmp.path().join("assets").join("jars");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.png"), b"png").unwrap();
        std::fs::write(nested.join("notes.txt"), b"skip me").unwrap();
        std::fs::write(tmp.path().join("assets").join("b.JPG"), b"jpg").unwrap();

        let assets = cat.list_assets();
        assert_eq!(assets.len(), 2);
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::DesignSpec;

pub const JAR_REQUIRED_DIMENSIONS: [&str; 4] =
    ["outer_diameter_mm", "height_mm", "wall_thickness_mm", "cap_height_mm"];
pub const BOTTLE_REQUIRED_DIMENSIONS: [&str; 5] = [
    "body_diameter_mm",
    "body_height_mm",
    "neck_diameter_mm",
    "neck_height_mm",
    "wall_thickness_mm",
];

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(180);
const PYTHON_BIN: &str = "python3";

pub const CAD_LLM_SYSTEM_PROMPT: &str = "\
You are a senior mechanical CAD engineer and geometric reconstruction specialist.

Return ONLY Python code for CadQuery that creates closed BREP solids and exports a STEP file.
No markdown fences, no explanation, no STL, no mesh operations.
Use mm units, realistic manufacturable geometry, and keep script deterministic.
Script must define geometry variables and call cq.exporters.export(..., <step_path>).";

#[derive(Debug, Error, PartialEq)]
pub enum CadError {
    #[error("Missing CAD dimensions: {}. Provide these in mm before CAD generation.", missing.join(", "))]
    MissingDimensions { missing: Vec<String> },
    #[error("Unsupported packaging type for CAD generation. Supported types: cosmetic jar and bottle.")]
    UnsupportedProductType,
}

#[derive(Debug, Error, PartialEq)]
pub enum CadScriptError {
    #[error("Generated CAD script contains blocked token: {0}")]
    BlockedToken(String),
    #[error("Generated CAD script is missing CadQuery import.")]
    MissingImport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CadGeneration {
    pub cad_code: String,
    pub summary: String,
}

pub fn required_dimensions_for_type(product_type: Option<&str>) -> &'static [&'static str] {
    match product_type {
        Some("jar") | Some("cosmetic_jar") => &JAR_REQUIRED_DIMENSIONS,
        Some("bottle") => &BOTTLE_REQUIRED_DIMENSIONS,
        _ => &[],
    }
}

/// Draft angle for molded thermoplastics; glass and other rigid materials
/// eject without taper.
fn draft_angle(material: &str) -> f64 {
    match material {
        "pp" | "pet" | "hdpe" | "other" => 1.5,
        _ => 0.0,
    }
}

/// Deterministic dimension-driven CAD generation. Validates that every
/// dimension required for the product type is present, then templates a
/// parametric CadQuery script and a human-readable summary. Missing keys are
/// a reported error naming exactly which keys are absent.
pub fn generate_cadquery_code(spec: &DesignSpec) -> Result<CadGeneration, CadError> {
    let ptype = spec.product_type.as_deref().unwrap_or("").to_lowercase();

    let required = required_dimensions_for_type(Some(ptype.as_str()));
    let missing: Vec<String> = required
        .iter()
        .filter(|k| !spec.dimensions.contains_key(**k))
        .map(|k| k.to_string())
        .collect();
    if !required.is_empty() && !missing.is_empty() {
        return Err(CadError::MissingDimensions { missing });
    }

    let material = spec.intended_material.as_deref().unwrap_or("other").to_lowercase();
    let draft = draft_angle(&material);
    let material_label = spec.intended_material.as_deref().unwrap_or("unspecified");

    match ptype.as_str() {
        "jar" | "cosmetic_jar" => {
            let od = spec.dimensions["outer_diameter_mm"];
            let h = spec.dimensions["height_mm"];
            let wall = spec.dimensions["wall_thickness_mm"];
            let cap_h = spec.dimensions["cap_height_mm"];

            let summary = format!(
                "Cosmetic jar with screw-cap style closure, OD {od} mm, body height {h} mm, \
                 wall {wall} mm, cap height {cap_h} mm, material {material_label}."
            );
            let cad_code = jar_script(od, h, wall, cap_h, draft);
            Ok(CadGeneration { cad_code, summary })
        }
        "bottle" => {
            let bd = spec.dimensions["body_diameter_mm"];
            let bh = spec.dimensions["body_height_mm"];
            let nd = spec.dimensions["neck_diameter_mm"];
            let nh = spec.dimensions["neck_height_mm"];
            let wall = spec.dimensions["wall_thickness_mm"];

            let summary = format!(
                "Bottle with simplified flip-top cap geometry, body diameter {bd} mm, body height {bh} mm, \
                 neck diameter {nd} mm, neck height {nh} mm, wall {wall} mm, material {material_label}."
            );
            let cad_code = bottle_script(bd, bh, nd, nh, wall, draft);
            Ok(CadGeneration { cad_code, summary })
        }
        _ => Err(CadError::UnsupportedProductType),
    }
}

fn jar_script(od: f64, h: f64, wall: f64, cap_h: f64, draft: f64) -> String {
    format!(
        r#"import cadquery as cq

# Cosmetic jar + simplified screw cap for STEP-ready solid export
outer_diameter = {od}
body_height = {h}
wall = {wall}
cap_height = {cap_h}
draft_deg = {draft}

inner_diameter = outer_diameter - (2 * wall)
if inner_diameter <= 0:
    raise ValueError("wall_thickness_mm is too large for given outer_diameter_mm")

# Jar body with draft for injection molded plastics; draft is 0 for glass.
body = (
    cq.Workplane("XY")
    .circle(outer_diameter / 2)
    .extrude(body_height, taper=-draft_deg)
)

cavity = (
    cq.Workplane("XY")
    .workplane(offset=wall)
    .circle(inner_diameter / 2)
    .extrude(body_height - wall)
)
jar = body.cut(cavity)

# Simplified cap shell (thread omitted intentionally for robust parametric generation)
cap_outer = outer_diameter * 1.02
cap_inner = cap_outer - (2 * wall)
cap = (
    cq.Workplane("XY")
    .workplane(offset=body_height)
    .circle(cap_outer / 2)
    .extrude(cap_height, taper=-draft_deg)
)
cap_void = (
    cq.Workplane("XY")
    .workplane(offset=body_height + wall)
    .circle(cap_inner / 2)
    .extrude(cap_height - wall)
)
cap = cap.cut(cap_void)

assembly = cq.Assembly()
assembly.add(jar, name="jar")
assembly.add(cap, name="cap")

# STEP export compatibility
cq.exporters.export(jar, "jar.step")
cq.exporters.export(cap, "jar_cap.step")"#
    )
}

fn bottle_script(bd: f64, bh: f64, nd: f64, nh: f64, wall: f64, draft: f64) -> String {
    format!(
        r#"import cadquery as cq

# Bottle + simplified flip-top cap (hinge as conceptual feature), STEP-ready solids
body_diameter = {bd}
body_height = {bh}
neck_diameter = {nd}
neck_height = {nh}
wall = {wall}
draft_deg = {draft}

inner_body_diameter = body_diameter - (2 * wall)
if inner_body_diameter <= 0:
    raise ValueError("wall_thickness_mm is too large for given body_diameter_mm")

body = (
    cq.Workplane("XY")
    .circle(body_diameter / 2)
    .extrude(body_height, taper=-draft_deg)
)
shoulder = (
    cq.Workplane("XY")
    .workplane(offset=body_height)
    .circle(body_diameter / 2)
    .workplane(offset=neck_height)
    .circle(neck_diameter / 2)
    .loft(combine=True)
)
neck = (
    cq.Workplane("XY")
    .workplane(offset=body_height + neck_height)
    .circle(neck_diameter / 2)
    .extrude(neck_height * 0.4)
)
bottle_outer = body.union(shoulder).union(neck)

cavity = (
    cq.Workplane("XY")
    .workplane(offset=wall)
    .circle(inner_body_diameter / 2)
    .extrude(body_height + neck_height)
)
bottle = bottle_outer.cut(cavity)

# Simplified flip-top cap, thread omitted intentionally for robust manufacturable base geometry
cap_h = neck_height * 0.9
cap_outer = neck_diameter * 1.15
cap_inner = cap_outer - (2 * wall)
cap_base = (
    cq.Workplane("XY")
    .workplane(offset=body_height + neck_height * 1.4)
    .circle(cap_outer / 2)
    .extrude(cap_h)
)
cap_void = (
    cq.Workplane("XY")
    .workplane(offset=body_height + neck_height * 1.4 + wall)
    .circle(cap_inner / 2)
    .extrude(max(cap_h - wall, wall * 0.5))
)
cap = cap_base.cut(cap_void)
lid = (
    cq.Workplane("XY")
    .workplane(offset=body_height + neck_height * 1.4 + cap_h)
    .rect(cap_outer * 0.9, cap_outer * 0.9)
    .extrude(wall)
)
cap = cap.union(lid)

cq.exporters.export(bottle, "bottle.step")
cq.exporters.export(cap, "flip_top_cap.step")"#
    )
}

/// Strips markdown fences from provider-returned code.
pub fn extract_python_code(text: &str) -> String {
    let raw = text.trim();
    if raw.starts_with("```") {
        let fence = Regex::new(r"(?is)```(?:python)?\s*([\s\S]*?)```").expect("static pattern");
        if let Some(caps) = fence.captures(raw) {
            return caps[1].trim().to_string();
        }
    }
    raw.to_string()
}

/// Denylist plus required-import check for scripts we are about to execute.
pub fn validate_cad_script(script: &str) -> Result<(), CadScriptError> {
    const BANNED_TOKENS: [&str; 9] = [
        "import os",
        "import sys",
        "import subprocess",
        "import socket",
        "import requests",
        "eval(",
        "exec(",
        "open(",
        "__import__",
    ];
    let lowered = script.to_lowercase();
    for token in BANNED_TOKENS {
        if lowered.contains(token) {
            return Err(CadScriptError::BlockedToken(token.to_string()));
        }
    }
    if !lowered.contains("import cadquery") && !lowered.contains("from cadquery") {
        return Err(CadScriptError::MissingImport);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CadRunArtifacts {
    pub script_path: PathBuf,
    pub step_path: PathBuf,
}

/// Executes a generated script in an isolated per-run directory with a hard
/// wall-clock timeout, then locates the newest exported STEP file. Failures
/// return the captured error text; nothing is retried here.
pub async fn run_generated_script(
    script_text: &str,
    run_root: &Path,
    session_key: &str,
) -> Result<CadRunArtifacts, String> {
    let run_dir = run_root.join(format!("{session_key}-{}", &Uuid::new_v4().simple().to_string()[..8]));
    fs::create_dir_all(&run_dir).map_err(|e| format!("could not create run dir: {e}"))?;
    let script_path = run_dir.join("generated_cad.py");
    fs::write(&script_path, script_text).map_err(|e| format!("could not write script: {e}"))?;

    info!(dir = %run_dir.display(), "executing generated CAD script");
    let child = Command::new(PYTHON_BIN)
        .arg(&script_path)
        .current_dir(&run_dir)
        .env("PYTHONUNBUFFERED", "1")
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(SCRIPT_TIMEOUT, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("CAD script could not be started: {e}")),
        Err(_) => return Err("CAD script execution timed out.".to_string()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        let detail = detail.trim();
        let truncated: String = detail.chars().take(800).collect();
        error!("CAD script execution failed: {truncated}");
        return Err(format!("CAD script execution failed: {truncated}"));
    }

    let step_path = newest_step_file(&run_dir).ok_or_else(|| {
        "CAD script ran but no STEP file was produced. Ensure exporters.export outputs .step."
            .to_string()
    })?;
    Ok(CadRunArtifacts { script_path, step_path })
}

fn newest_step_file(dir: &Path) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    collect_step_files(dir, &mut candidates);
    candidates
        .into_iter()
        .max_by_key(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
}

fn collect_step_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_step_files(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_lowercase().as_str(), "step" | "stp"))
        {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn jar_spec() -> DesignSpec {
        let mut spec = DesignSpec {
            product_type: Some("jar".to_string()),
            intended_material: Some("pp".to_string()),
            ..DesignSpec::default()
        };
        spec.dimensions.insert("outer_diameter_mm".to_string(), 60.0);
        spec.dimensions.insert("height_mm".to_string(), 80.0);
        spec.dimensions.insert("wall_thickness_mm".to_string(), 2.0);
        spec.dimensions.insert("cap_height_mm".to_string(), 14.0);
        spec
    }

    #[test]
    fn missing_jar_dimensions_are_named_exactly() {
        let mut spec = jar_spec();
        spec.dimensions.remove("wall_thickness_mm");
        spec.dimensions.remove("cap_height_mm");

        let err = generate_cadquery_code(&spec).unwrap_err();
        assert_eq!(
            err,
            CadError::MissingDimensions {
                missing: vec!["wall_thickness_mm".to_string(), "cap_height_mm".to_string()]
            }
        );
        assert_eq!(
            err.to_string(),
            "Missing CAD dimensions: wall_thickness_mm, cap_height_mm. \
             Provide these in mm before CAD generation."
        );
    }

    #[test]
    fn bottle_requires_its_own_dimension_set() {
        let spec = DesignSpec {
            product_type: Some("bottle".to_string()),
            ..DesignSpec::default()
        };
        let err = generate_cadquery_code(&spec).unwrap_err();
        match err {
            CadError::MissingDimensions { missing } => {
                assert_eq!(missing.len(), BOTTLE_REQUIRED_DIMENSIONS.len());
                assert_eq!(missing[0], "body_diameter_mm");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn jar_generation_embeds_dimensions_and_draft() {
        let generated = generate_cadquery_code(&jar_spec()).unwrap();
        assert!(generated.cad_code.contains("outer_diameter = 60"));
        assert!(generated.cad_code.contains("draft_deg = 1.5"));
        assert!(generated.cad_code.contains("cq.exporters.export(jar, \"jar.step\")"));
        assert!(generated.summary.contains("OD 60 mm"));
        assert!(generated.summary.contains("material pp"));
        assert!(validate_cad_script(&generated.cad_code).is_ok());
    }

    #[test]
    fn glass_material_gets_zero_draft() {
        let mut spec = jar_spec();
        spec.intended_material = Some("glass".to_string());
        let generated = generate_cadquery_code(&spec).unwrap();
        assert!(generated.cad_code.contains("draft_deg = 0"));
    }

    #[test]
    fn bottle_generation_produces_flip_top_script() {
        let mut spec = DesignSpec {
            product_type: Some("bottle".to_string()),
            intended_material: Some("pet".to_string()),
            ..DesignSpec::default()
        };
        for (key, value) in [
            ("body_diameter_mm", 45.0),
            ("body_height_mm", 120.0),
            ("neck_diameter_mm", 20.0),
            ("neck_height_mm", 18.0),
            ("wall_thickness_mm", 1.2),
        ] {
            spec.dimensions.insert(key.to_string(), value);
        }
        let generated = generate_cadquery_code(&spec).unwrap();
        assert!(generated.cad_code.contains("neck_diameter = 20"));
        assert!(generated.cad_code.contains("flip_top_cap.step"));
        assert!(generated.summary.starts_with("Bottle with simplified flip-top cap geometry"));
        assert!(validate_cad_script(&generated.cad_code).is_ok());
    }

    #[test]
    fn unsupported_type_is_a_reported_error() {
        let spec = DesignSpec {
            product_type: Some("container".to_string()),
            ..DesignSpec::default()
        };
        assert_eq!(generate_cadquery_code(&spec).unwrap_err(), CadError::UnsupportedProductType);
    }

    #[test]
    fn script_validation_blocks_dangerous_tokens() {
        let err = validate_cad_script("import cadquery as cq\nimport os\n").unwrap_err();
        assert_eq!(err, CadScriptError::BlockedToken("import os".to_string()));

        let err = validate_cad_script("print('no cad here')").unwrap_err();
        assert_eq!(err, CadScriptError::MissingImport);
    }

    #[test]
    fn fenced_code_is_unwrapped() {
        let fenced = "```python\nimport cadquery as cq\n```";
        assert_eq!(extract_python_code(fenced), "import cadquery as cq");

        let bare = "import cadquery as cq";
        assert_eq!(extract_python_code(bare), bare);
    }
}

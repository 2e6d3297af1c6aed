use regex::Regex;

use crate::models::DesignSpec;

/// Ordered product-type patterns; first match wins. "cosmetic jar" must be
/// tried before the bare "jar" word.
const PRODUCT_PATTERNS: [(&str, &str); 5] = [
    (r"\bcosmetic\s+jar\b", "cosmetic_jar"),
    (r"\bjar\b", "jar"),
    (r"\bbottle\b", "bottle"),
    (r"\bcontainer\b", "container"),
    (r"\bcap\b", "cap"),
];

const MATERIAL_HINTS: [&str; 7] = ["pp", "pet", "hdpe", "glass", "aluminum", "paper", "other"];
const CLOSURE_HINTS: [&str; 7] = ["screw", "flip top", "snap", "pump", "press", "lid", "cork"];
const STYLE_HINTS: [&str; 7] =
    ["minimal", "luxury", "matte", "gloss", "premium", "playful", "clinical"];

const DIM_TOKENS: [&str; 4] = ["diameter", "height", "thickness", "mm"];
const TYPE_CONTEXT_PHRASES: [&str; 5] =
    ["product type", "packaging type", "i need", "i want", "make a"];

const DIMENSION_PATTERNS: [(&str, &str); 8] = [
    ("outer_diameter_mm", r"outer\s*diameter\s*(?:=|:)?\s*(\d+(?:\.\d+)?)\s*mm"),
    ("height_mm", r"(?:body\s*)?height\s*(?:=|:)?\s*(\d+(?:\.\d+)?)\s*mm"),
    ("wall_thickness_mm", r"wall\s*thickness\s*(?:=|:)?\s*(\d+(?:\.\d+)?)\s*mm"),
    ("cap_height_mm", r"cap\s*height\s*(?:=|:)?\s*(\d+(?:\.\d+)?)\s*mm"),
    ("body_diameter_mm", r"body\s*diameter\s*(?:=|:)?\s*(\d+(?:\.\d+)?)\s*mm"),
    ("body_height_mm", r"body\s*height\s*(?:=|:)?\s*(\d+(?:\.\d+)?)\s*mm"),
    ("neck_diameter_mm", r"neck\s*diameter\s*(?:=|:)?\s*(\d+(?:\.\d+)?)\s*mm"),
    ("neck_height_mm", r"neck\s*height\s*(?:=|:)?\s*(\d+(?:\.\d+)?)\s*mm"),
];

fn pattern(src: &str) -> Regex {
    Regex::new(src).expect("static pattern")
}

fn extract_dimensions(message: &str) -> Vec<(String, f64)> {
    let lower = message.to_lowercase();
    let mut dims = Vec::new();
    for (key, pat) in DIMENSION_PATTERNS {
        if let Some(caps) = pattern(pat).captures(&lower) {
            if let Ok(value) = caps[1].parse::<f64>() {
                dims.push((key.to_string(), value));
            }
        }
    }
    dims
}

/// Mutates the spec in place from one free-form message. Absence of a match
/// is silently a no-op; nothing here errors.
pub fn update_spec_from_message(spec: &mut DesignSpec, message: &str) {
    let lower = message.to_lowercase();

    let has_dim_tokens = DIM_TOKENS.iter().any(|t| lower.contains(t));
    let type_context = TYPE_CONTEXT_PHRASES.iter().any(|p| lower.contains(p));
    let mut detected_product: Option<&str> = None;
    for (pat, product) in PRODUCT_PATTERNS {
        if pattern(pat).is_match(&lower) {
            detected_product = Some(product);
            break;
        }
    }

    // Dimension-only messages (e.g. "cap height 14 mm") must not overwrite
    // an already established product type.
    if let Some(product) = detected_product {
        if product == "cap" && lower.contains("cap height") && spec.product_type.is_some() {
            detected_product = None;
        } else if has_dim_tokens && spec.product_type.is_some() && !type_context {
            detected_product = None;
        }
    }

    if let Some(product) = detected_product {
        spec.product_type = Some(product.to_string());
    }

    for hint in MATERIAL_HINTS {
        if lower.contains(hint) {
            spec.intended_material = Some(hint.to_string());
            break;
        }
    }

    for hint in CLOSURE_HINTS {
        if lower.contains(hint) {
            spec.closure_type = Some(hint.to_string());
            break;
        }
    }

    for hint in STYLE_HINTS {
        if lower.contains(hint) {
            spec.design_style = Some(hint.to_string());
            break;
        }
    }

    if let Some(caps) = pattern(r"(\d+(?:\.\d+)?)\s*(ml|l|cc)").captures(&lower) {
        spec.size_or_volume = Some(format!("{} {}", &caps[1], &caps[2]));
    }

    if spec.size_or_volume.is_none() {
        if let Some(caps) = pattern(r"(\d+(?:\.\d+)?)\s*(mm|cm)").captures(&lower) {
            spec.size_or_volume = Some(format!("{} {}", &caps[1], &caps[2]));
        }
    }

    for (key, value) in extract_dimensions(message) {
        spec.dimensions.insert(key, value);
    }
}

fn or_not_provided(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("Not provided")
}

/// Single-line human readable summary of the current spec.
pub fn spec_summary(spec: &DesignSpec) -> String {
    let mut parts = vec![
        format!("Product Type: {}", or_not_provided(&spec.product_type)),
        format!("Approx Size/Volume: {}", or_not_provided(&spec.size_or_volume)),
        format!("Intended Material: {}", or_not_provided(&spec.intended_material)),
        format!("Closure Type: {}", or_not_provided(&spec.closure_type)),
        format!("Design Style: {}", or_not_provided(&spec.design_style)),
    ];
    if !spec.dimensions.is_empty() {
        let dim_txt = spec
            .dimensions
            .iter()
            .map(|(k, v)| format!("{k}={v} mm"))
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("Dimensions: {dim_txt}"));
    }
    parts.join(" | ")
}

/// Fixed ordered checklist over the five top-level scalar fields.
/// Dimensions are deliberately not part of it.
pub fn missing_fields(spec: &DesignSpec) -> Vec<String> {
    let mut missing = Vec::new();
    if spec.product_type.is_none() {
        missing.push("product type".to_string());
    }
    if spec.size_or_volume.is_none() {
        missing.push("approx size or volume".to_string());
    }
    if spec.intended_material.is_none() {
        missing.push("intended material".to_string());
    }
    if spec.closure_type.is_none() {
        missing.push("closure type".to_string());
    }
    if spec.design_style.is_none() {
        missing.push("design style".to_string());
    }
    missing
}

pub fn required_questions_for_missing(missing: &[String]) -> Vec<String> {
    missing
        .iter()
        .filter_map(|m| {
            let q = match m.as_str() {
                "product type" => "What packaging type do you want (jar, bottle, cap, or container)?",
                "approx size or volume" => {
                    "What is the approximate size or volume (for example 50 ml or 120 mm height)?"
                }
                "intended material" => {
                    "What material should we target (for example PP, PET, HDPE, or glass)?"
                }
                "closure type" => "What closure type do you want (screw, flip top, snap, pump, etc.)?",
                "design style" => {
                    "What design style should the concept follow (minimal, matte, luxury, etc.)?"
                }
                _ => return None,
            };
            Some(q.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn one_shot_message_fills_all_fields() {
        let mut spec = DesignSpec::default();
        update_spec_from_message(&mut spec, "I want a 50 ml PP jar with screw cap, minimal style");
        assert_eq!(spec.product_type.as_deref(), Some("jar"));
        assert_eq!(spec.size_or_volume.as_deref(), Some("50 ml"));
        assert_eq!(spec.intended_material.as_deref(), Some("pp"));
        assert_eq!(spec.closure_type.as_deref(), Some("screw"));
        assert_eq!(spec.design_style.as_deref(), Some("minimal"));
        assert!(missing_fields(&spec).is_empty());
    }

    #[test]
    fn cap_height_does_not_clobber_product_type() {
        let mut spec = DesignSpec::default();
        spec.product_type = Some("bottle".to_string());
        update_spec_from_message(&mut spec, "cap height 14 mm");
        assert_eq!(spec.product_type.as_deref(), Some("bottle"));
        assert_eq!(spec.dimensions.get("cap_height_mm"), Some(&14.0));
    }

    #[test]
    fn dimension_only_message_keeps_existing_type() {
        let mut spec = DesignSpec::default();
        spec.product_type = Some("jar".to_string());
        update_spec_from_message(&mut spec, "outer diameter 60 mm for the container");
        assert_eq!(spec.product_type.as_deref(), Some("jar"));
        assert_eq!(spec.dimensions.get("outer_diameter_mm"), Some(&60.0));
    }

    #[test]
    fn explicit_type_context_still_overrides() {
        let mut spec = DesignSpec::default();
        spec.product_type = Some("jar".to_string());
        update_spec_from_message(&mut spec, "i want a bottle, height 120 mm");
        assert_eq!(spec.product_type.as_deref(), Some("bottle"));
    }

    #[test]
    fn volume_preferred_over_length_fallback() {
        let mut spec = DesignSpec::default();
        update_spec_from_message(&mut spec, "a 100 ml bottle around 120 mm tall");
        assert_eq!(spec.size_or_volume.as_deref(), Some("100 ml"));
    }

    #[test]
    fn length_fallback_only_when_unset() {
        let mut spec = DesignSpec::default();
        update_spec_from_message(&mut spec, "roughly 120 mm tall");
        assert_eq!(spec.size_or_volume.as_deref(), Some("120 mm"));

        update_spec_from_message(&mut spec, "make it 50 ml instead");
        assert_eq!(spec.size_or_volume.as_deref(), Some("50 ml"));
    }

    #[test]
    fn dimensions_overlay_and_survive_unrelated_messages() {
        let mut spec = DesignSpec::default();
        update_spec_from_message(&mut spec, "wall thickness = 2 mm");
        assert_eq!(spec.dimensions.get("wall_thickness_mm"), Some(&2.0));

        update_spec_from_message(&mut spec, "let's go with a luxury look");
        assert_eq!(spec.dimensions.get("wall_thickness_mm"), Some(&2.0));

        update_spec_from_message(&mut spec, "wall thickness: 2.5 mm");
        assert_eq!(spec.dimensions.get("wall_thickness_mm"), Some(&2.5));
    }

    #[test]
    fn cosmetic_jar_wins_over_bare_jar() {
        let mut spec = DesignSpec::default();
        update_spec_from_message(&mut spec, "i need a cosmetic jar for face cream");
        assert_eq!(spec.product_type.as_deref(), Some("cosmetic_jar"));
    }

    #[test]
    fn missing_fields_ordered_and_idempotent() {
        let mut spec = DesignSpec::default();
        spec.intended_material = Some("glass".to_string());
        let first = missing_fields(&spec);
        assert_eq!(
            first,
            vec![
                "product type".to_string(),
                "approx size or volume".to_string(),
                "closure type".to_string(),
                "design style".to_string(),
            ]
        );
        assert_eq!(first, missing_fields(&spec));
    }

    #[test]
    fn questions_follow_missing_order() {
        let missing = vec!["closure type".to_string(), "design style".to_string()];
        let questions = required_questions_for_missing(&missing);
        assert_eq!(questions.len(), 2);
        assert!(questions[0].starts_with("What closure type"));
        assert!(questions[1].starts_with("What design style"));
    }

    #[test]
    fn summary_is_stable_and_includes_dimensions() {
        let mut spec = DesignSpec::default();
        update_spec_from_message(&mut spec, "50 ml pp jar, screw cap, matte, wall thickness 2 mm");
        let summary = spec_summary(&spec);
        assert_eq!(summary, spec_summary(&spec));
        assert!(summary.starts_with("Product Type: jar | Approx Size/Volume: 50 ml"));
        assert!(summary.contains("Dimensions: wall_thickness_mm=2 mm"));
    }

    #[test]
    fn empty_spec_summary_uses_placeholders() {
        let spec = DesignSpec::default();
        assert_eq!(
            spec_summary(&spec),
            "Product Type: Not provided | Approx Size/Volume: Not provided | \
             Intended Material: Not provided | Closure Type: Not provided | \
             Design Style: Not provided"
        );
    }
}

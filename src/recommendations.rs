use crate::models::DesignSpec;

/// Advisory edit suggestions derived from the spec. Pure rule table; no
/// state mutation, at most 6 results, duplicates dropped first-seen.
pub fn build_edit_recommendations(spec: &DesignSpec) -> Vec<String> {
    let mut recs: Vec<&str> = Vec::new();
    let ptype = spec.product_type.as_deref().unwrap_or("").to_lowercase();
    let material = spec.intended_material.as_deref().unwrap_or("").to_lowercase();
    let style = spec.design_style.as_deref().unwrap_or("").to_lowercase();
    let closure = spec.closure_type.as_deref().unwrap_or("").to_lowercase();

    if ptype == "jar" || ptype == "cosmetic_jar" {
        recs.push("Increase cap height by 8% for better shelf presence.");
        recs.push("Reduce shoulder radius slightly for a tighter premium profile.");
    }
    if ptype == "bottle" {
        recs.push("Narrow neck transition for better ergonomic pour posture.");
        recs.push("Raise shoulder start point by 5% to improve label panel area.");
    }

    if material == "pp" || material == "hdpe" || material == "pet" {
        recs.push("Add subtle draft-friendly taper cue to communicate molded feasibility.");
    }
    if material == "glass" {
        recs.push("Thicken visual base proportion to imply glass stability.");
    }

    if style.contains("matte") {
        recs.push("Increase matte softness and reduce specular highlight intensity.");
    }
    if style.contains("luxury") || style.contains("premium") {
        recs.push("Introduce controlled metallic accent on closure ring.");
    }
    if style.contains("minimal") {
        recs.push("Simplify silhouette contrast by removing one secondary groove.");
    }

    if closure.contains("flip") {
        recs.push("Make flip-top hinge zone visually stronger and slightly wider.");
    }
    if closure.contains("screw") {
        recs.push("Refine cap knurl band for better grip and consistent rhythm.");
    }

    let mut deduped: Vec<String> = Vec::new();
    for rec in recs {
        if !deduped.iter().any(|seen| seen == rec) {
            deduped.push(rec.to_string());
        }
    }
    deduped.truncate(6);
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_spec_yields_no_recommendations() {
        assert!(build_edit_recommendations(&DesignSpec::default()).is_empty());
    }

    #[test]
    fn jar_rules_fire_for_cosmetic_jar_too() {
        let spec = DesignSpec {
            product_type: Some("cosmetic_jar".to_string()),
            ..DesignSpec::default()
        };
        let recs = build_edit_recommendations(&spec);
        assert_eq!(recs.len(), 2);
        assert!(recs[0].contains("cap height"));
    }

    #[test]
    fn full_spec_is_capped_at_six() {
        let spec = DesignSpec {
            product_type: Some("jar".to_string()),
            intended_material: Some("pp".to_string()),
            design_style: Some("luxury matte".to_string()),
            closure_type: Some("screw".to_string()),
            ..DesignSpec::default()
        };
        let recs = build_edit_recommendations(&spec);
        assert_eq!(recs.len(), 6);
    }

    #[test]
    fn order_is_rule_table_order_and_stable() {
        let spec = DesignSpec {
            product_type: Some("bottle".to_string()),
            intended_material: Some("glass".to_string()),
            closure_type: Some("flip top".to_string()),
            ..DesignSpec::default()
        };
        let recs = build_edit_recommendations(&spec);
        assert_eq!(
            recs,
            vec![
                "Narrow neck transition for better ergonomic pour posture.".to_string(),
                "Raise shoulder start point by 5% to improve label panel area.".to_string(),
                "Thicken visual base proportion to imply glass stability.".to_string(),
                "Make flip-top hinge zone visually stronger and slightly wider.".to_string(),
            ]
        );
        assert_eq!(recs, build_edit_recommendations(&spec));
    }
}

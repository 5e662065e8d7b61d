//! Maps provider product identifiers to subscription tiers.
//!
//! Resolution never fails: an identifier that matches nothing degrades to
//! [`Tier::Free`] so that an unknown SKU neither grants nor blocks service.

use crate::models::subscription::Tier;

const PLAN_TIERS: [(&str, Tier); 2] = [("pro_plan", Tier::Pro), ("analyst_plan", Tier::Analyst)];

/// Leading underscore-delimited segment, or the first two when the second is `plan`.
///
/// `pro_plan_monthly` -> `pro_plan`, `analyst_yearly` -> `analyst`.
pub fn base_plan(product_id: &str) -> &str {
    let mut segments = product_id.splitn(3, '_');
    let first = segments.next().unwrap_or_default();
    match segments.next() {
        Some("plan") => &product_id[..first.len() + "_plan".len()],
        _ => first,
    }
}

pub fn resolve(product_id: &str) -> Tier {
    let base = base_plan(product_id.trim());

    if let Some((_, tier)) = PLAN_TIERS.iter().find(|(plan, _)| *plan == base) {
        return *tier;
    }

    let candidate = base.split('_').next().unwrap_or_default();
    let tier = Tier::from_name(candidate);
    log::debug!(
        "Resolved product {} via base plan {} to tier {}",
        product_id,
        base,
        tier
    );
    tier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_plan_extraction() {
        assert_eq!(base_plan("pro_plan_monthly"), "pro_plan");
        assert_eq!(base_plan("analyst_plan"), "analyst_plan");
        assert_eq!(base_plan("analyst_yearly"), "analyst");
        assert_eq!(base_plan("pro"), "pro");
        assert_eq!(base_plan(""), "");
    }

    #[test]
    fn test_resolve_known_plans() {
        assert_eq!(resolve("pro_plan_monthly"), Tier::Pro);
        assert_eq!(resolve("analyst_plan_yearly"), Tier::Analyst);
    }

    #[test]
    fn test_resolve_falls_back_to_tier_names() {
        assert_eq!(resolve("PRO_yearly"), Tier::Pro);
        assert_eq!(resolve("analyst"), Tier::Analyst);
        assert_eq!(resolve("free_plan_monthly"), Tier::Free);
    }

    #[test]
    fn test_resolve_unknown_is_free() {
        assert_eq!(resolve("unknown_widget"), Tier::Free);
        assert_eq!(resolve(""), Tier::Free);
        assert_eq!(resolve("enterprise_plan_monthly"), Tier::Free);
    }
}

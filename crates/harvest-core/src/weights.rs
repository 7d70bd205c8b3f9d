//! Weight resolution and outside-allocation accrual

use crate::policy::{AssetClass, PolicyConfig};

impl PolicyConfig {
    /// Target weight of `class` in `year`.
    ///
    /// Without age adjustment this is the static weight. With it, the
    /// age-weighted partition is renormalized and scaled by `age / 100`, and
    /// the growth partition by `1 - age / 100`. The age factor is not
    /// clamped, so ages past 100 push growth weights negative.
    pub fn effective_weight(&self, class: &AssetClass, year: i32) -> f64 {
        let Some(adjustment) = self.age_adjustment else {
            return class.weight;
        };

        let age = (year - adjustment.birth_year) as f64;
        let age_factor = age / 100.0;
        let (aged_sum, growth_sum) = self.partition_sums();

        if class.age_weighted {
            age_factor / aged_sum * class.weight
        } else {
            (1.0 - age_factor) / growth_sum * class.weight
        }
    }

    /// Outside holdings counted toward `class` in `year`.
    pub fn outside_allocation(&self, class: &AssetClass, year: i32) -> f64 {
        if !self.use_outside_allocation {
            return 0.0;
        }
        class
            .outside_allocation
            .map(|schedule| schedule.amount_for_year(year))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::policy::{AgeAdjustment, OutsideAllocationSchedule, PolicyConfig};
    use approx::assert_relative_eq;

    fn total_weight(policy: &PolicyConfig, year: i32) -> f64 {
        policy
            .asset_classes
            .iter()
            .map(|c| policy.effective_weight(c, year))
            .sum()
    }

    #[test]
    fn test_static_weights_without_age_adjustment() {
        let mut policy = PolicyConfig::diversified_default();
        policy.age_adjustment = None;

        let voo = policy.class("VOO").unwrap();
        assert_relative_eq!(policy.effective_weight(voo, 2024), 0.35);
        assert_relative_eq!(total_weight(&policy, 2024), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_age_adjusted_weights_sum_to_one() {
        let policy = PolicyConfig::diversified_default();
        for year in [1992, 2010, 2024, 2050, 2092] {
            assert_relative_eq!(total_weight(&policy, year), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_age_adjusted_split() {
        let policy = PolicyConfig::diversified_default();
        // age 32: age-weighted partition totals 0.32, growth 0.68
        let year = 2024;
        let aged: f64 = policy
            .asset_classes
            .iter()
            .filter(|c| c.age_weighted)
            .map(|c| policy.effective_weight(c, year))
            .sum();
        assert_relative_eq!(aged, 0.32, epsilon = 1e-9);

        // BND is 0.05 of an age-weighted partition summing to 0.25
        let bnd = policy.class("BND").unwrap();
        assert_relative_eq!(policy.effective_weight(bnd, year), 0.32 * 0.2, epsilon = 1e-9);

        // VOO is 0.35 of a growth partition summing to 0.75
        let voo = policy.class("VOO").unwrap();
        assert_relative_eq!(
            policy.effective_weight(voo, year),
            0.68 * 0.35 / 0.75,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_age_factor_is_not_clamped() {
        let mut policy = PolicyConfig::diversified_default();
        policy.age_adjustment = Some(AgeAdjustment { birth_year: 1900 });
        let voo = policy.class("VOO").unwrap();
        assert!(policy.effective_weight(voo, 2024) < 0.0);
        assert_relative_eq!(total_weight(&policy, 2024), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_outside_allocation_accrual() {
        let policy = PolicyConfig::diversified_default();
        let bnd = policy.class("BND").unwrap();

        assert_eq!(policy.outside_allocation(bnd, 2021), 0.0);
        assert_eq!(policy.outside_allocation(bnd, 2022), 50_000.0);

        let mut previous = policy.outside_allocation(bnd, 2022);
        for year in 2023..2030 {
            let amount = policy.outside_allocation(bnd, year);
            assert_relative_eq!(amount - previous, 5_000.0);
            previous = amount;
        }
    }

    #[test]
    fn test_outside_allocation_disabled_or_absent() {
        let mut policy = PolicyConfig::diversified_default();
        let vo = policy.class("VO").unwrap().clone();
        assert_eq!(policy.outside_allocation(&vo, 2030), 0.0);

        policy.use_outside_allocation = false;
        let voo = policy.class("VOO").unwrap().clone();
        assert_eq!(policy.outside_allocation(&voo, 2030), 0.0);

        let schedule = OutsideAllocationSchedule {
            initial: 1.0,
            yearly_increase: 1.0,
            start_year: 2000,
        };
        policy.use_outside_allocation = true;
        let with_schedule = vo.with_outside_allocation(schedule);
        assert_eq!(policy.outside_allocation(&with_schedule, 2003), 4.0);
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use super::channel::{Channel, ChannelRegistry};
use super::health::{HealthTracker, SelectionStrategy};
use super::GatewayError;

/// What the selector decided, for logging and response headers.
#[derive(Clone, Debug)]
pub struct SelectionInfo {
    pub channel: Arc<Channel>,
    pub available_count: usize,
    pub score: f64,
}

/// Health-aware, strategy-weighted load balancer over the channel snapshot.
///
/// Within the active priority tier, selection is Power-of-Two-Choices: two
/// distinct uniform-random candidates, the higher score wins.
pub struct ChannelSelector {
    tracker: Arc<HealthTracker>,
}

impl ChannelSelector {
    pub fn new(tracker: Arc<HealthTracker>) -> Self {
        Self { tracker }
    }

    pub fn select(
        &self,
        registry: &ChannelRegistry,
        group: &str,
        model: &str,
        strategy: Option<&SelectionStrategy>,
        ignore_first_priority: bool,
        exclude: &HashSet<i64>,
    ) -> Result<SelectionInfo, GatewayError> {
        let candidates = registry.candidates(group, model);
        let candidates: Vec<Arc<Channel>> = candidates
            .into_iter()
            .filter(|channel| !exclude.contains(&channel.id))
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::NoAvailableChannel {
                group: group.to_string(),
                model: model.to_string(),
            });
        }

        let tier = priority_tier(&candidates, ignore_first_priority);
        if tier.is_empty() {
            return Err(GatewayError::NoAvailableChannel {
                group: group.to_string(),
                model: model.to_string(),
            });
        }

        let (winner, score) = self.pick(tier, strategy);
        Ok(SelectionInfo {
            channel: winner.clone(),
            available_count: tier.len(),
            score,
        })
    }

    fn pick<'a>(
        &self,
        candidates: &'a [Arc<Channel>],
        strategy: Option<&SelectionStrategy>,
    ) -> (&'a Arc<Channel>, f64) {
        match candidates.len() {
            1 => {
                let only = &candidates[0];
                (only, self.channel_score(only, strategy))
            }
            2 => self.better(&candidates[0], &candidates[1], strategy),
            n => {
                let mut rng = rand::thread_rng();
                let idx1 = rng.gen_range(0..n);
                let mut idx2 = rng.gen_range(0..n - 1);
                if idx2 >= idx1 {
                    idx2 += 1;
                }
                self.better(&candidates[idx1], &candidates[idx2], strategy)
            }
        }
    }

    /// Equal scores return the first argument, so singleton comparisons are
    /// deterministic.
    fn better<'a>(
        &self,
        a: &'a Arc<Channel>,
        b: &'a Arc<Channel>,
        strategy: Option<&SelectionStrategy>,
    ) -> (&'a Arc<Channel>, f64) {
        let score_a = self.channel_score(a, strategy);
        let score_b = self.channel_score(b, strategy);
        if score_a >= score_b {
            (a, score_a)
        } else {
            (b, score_b)
        }
    }

    pub fn channel_score(&self, channel: &Channel, strategy: Option<&SelectionStrategy>) -> f64 {
        let weight = match channel.weight {
            Some(weight) if weight > 0 => f64::from(weight),
            _ => 1.0,
        };

        let Some(view) = self.tracker.snapshot(channel.id) else {
            // No health data: base score from weight alone, with a bump for
            // strategies that lean hard on cost.
            let mut base = weight * 1000.0;
            if let Some(strategy) = strategy {
                if strategy.cost > 0.4 {
                    base *= 1.0 + strategy.cost;
                }
            }
            return base;
        };

        match strategy {
            Some(strategy) => {
                // Weight doubles as an inverse cost proxy at this layer.
                let cost_ratio = 1.0 / weight;
                view.score_with_strategy(weight, strategy, cost_ratio)
            }
            None => view.score(weight),
        }
    }
}

/// Returns the highest-priority prefix of the (already sorted) candidate
/// list, or the complementary suffix when `ignore_first_priority` is set.
fn priority_tier(candidates: &[Arc<Channel>], ignore_first_priority: bool) -> &[Arc<Channel>] {
    if candidates.is_empty() {
        return candidates;
    }

    let first_priority = candidates[0].priority;
    let mut tier_end = candidates.len();
    if first_priority > 0 {
        for (idx, channel) in candidates.iter().enumerate() {
            if channel.priority != first_priority {
                tier_end = idx;
                break;
            }
        }
    }

    if ignore_first_priority && tier_end < candidates.len() {
        &candidates[tier_end..]
    } else {
        &candidates[..tier_end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::channel::test_channel;

    fn selector_with_tracker() -> (ChannelSelector, Arc<HealthTracker>) {
        let tracker = Arc::new(HealthTracker::new());
        (ChannelSelector::new(tracker.clone()), tracker)
    }

    fn registry_with(channels: Vec<crate::gateway::channel::Channel>) -> ChannelRegistry {
        let registry = ChannelRegistry::new();
        registry.rebuild(channels);
        registry
    }

    #[test]
    fn empty_snapshot_is_an_error() {
        let (selector, _) = selector_with_tracker();
        let registry = registry_with(Vec::new());
        let err = selector
            .select(&registry, "default", "gpt-4o", None, false, &HashSet::new())
            .expect_err("no channels");
        assert!(matches!(err, GatewayError::NoAvailableChannel { .. }));
    }

    #[test]
    fn singleton_is_always_selected() {
        let (selector, _) = selector_with_tracker();
        let registry = registry_with(vec![test_channel(5, "gpt-4o", "default")]);
        for _ in 0..100 {
            let info = selector
                .select(&registry, "default", "gpt-4o", None, false, &HashSet::new())
                .expect("selection");
            assert_eq!(info.channel.id, 5);
            assert_eq!(info.available_count, 1);
        }
    }

    #[test]
    fn two_candidates_pick_the_higher_score() {
        let (selector, tracker) = selector_with_tracker();
        let registry = registry_with(vec![
            test_channel(7, "gpt-4o-mini", "default"),
            test_channel(11, "gpt-4o-mini", "default"),
        ]);

        // Channel 11 is strictly healthier than channel 7.
        for _ in 0..10 {
            tracker.observe(11, 50, true, 0);
        }
        for _ in 0..10 {
            tracker.observe(7, 200, false, 0);
        }

        let info = selector
            .select(
                &registry,
                "default",
                "gpt-4o-mini",
                None,
                false,
                &HashSet::new(),
            )
            .expect("selection");
        assert_eq!(info.channel.id, 11);
        assert_eq!(info.available_count, 2);
    }

    #[test]
    fn p2c_favors_the_healthier_channel() {
        let (selector, tracker) = selector_with_tracker();
        let registry = registry_with(vec![
            test_channel(1, "gpt-4o", "default"),
            test_channel(2, "gpt-4o", "default"),
            test_channel(3, "gpt-4o", "default"),
        ]);

        for _ in 0..20 {
            tracker.observe(1, 50, true, 0);
            tracker.observe(2, 50, true, 0);
            tracker.observe(3, 50, false, 0);
        }

        let mut unhealthy_wins = 0usize;
        for _ in 0..1000 {
            let info = selector
                .select(&registry, "default", "gpt-4o", None, false, &HashSet::new())
                .expect("selection");
            if info.channel.id == 3 {
                unhealthy_wins += 1;
            }
        }
        // The two P2C picks are distinct and 3 scores strictly lowest, so it
        // always loses the comparison.
        assert_eq!(unhealthy_wins, 0);
    }

    #[test]
    fn priority_tier_filters_to_highest() {
        let (selector, _) = selector_with_tracker();
        let mut high = test_channel(1, "gpt-4o", "default");
        high.priority = 10;
        let mut low = test_channel(2, "gpt-4o", "default");
        low.priority = 1;
        let registry = registry_with(vec![high, low]);

        let info = selector
            .select(&registry, "default", "gpt-4o", None, false, &HashSet::new())
            .expect("selection");
        assert_eq!(info.channel.id, 1);
        assert_eq!(info.available_count, 1);

        let info = selector
            .select(&registry, "default", "gpt-4o", None, true, &HashSet::new())
            .expect("selection");
        assert_eq!(info.channel.id, 2);
    }

    #[test]
    fn exclusion_removes_tried_channels() {
        let (selector, _) = selector_with_tracker();
        let registry = registry_with(vec![
            test_channel(1, "gpt-4o", "default"),
            test_channel(2, "gpt-4o", "default"),
        ]);

        let mut exclude = HashSet::new();
        exclude.insert(1i64);
        let info = selector
            .select(&registry, "default", "gpt-4o", None, false, &exclude)
            .expect("selection");
        assert_eq!(info.channel.id, 2);

        exclude.insert(2i64);
        assert!(selector
            .select(&registry, "default", "gpt-4o", None, false, &exclude)
            .is_err());
    }

    #[test]
    fn unknown_channels_get_weight_baseline() {
        let (selector, _) = selector_with_tracker();
        let mut weighted = test_channel(1, "gpt-4o", "default");
        weighted.weight = Some(3);
        assert!((selector.channel_score(&weighted, None) - 3000.0).abs() < 1e-9);

        let plain = test_channel(2, "gpt-4o", "default");
        let cost_strategy = crate::gateway::health::STRATEGY_COST;
        let boosted = selector.channel_score(&plain, Some(&cost_strategy));
        assert!((boosted - 1600.0).abs() < 1e-9);
    }
}

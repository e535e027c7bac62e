//! Which of the pending handlers run in this cycle.

use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    /// All pending handlers, in registration order.
    AllAtOnce,
    /// The first pending handler only.
    OneByOne,
    /// One pending handler picked at random.
    Randomized,
    /// All pending handlers in random order.
    Shuffled,
    /// The least retried handler; registration order breaks ties.
    #[default]
    Asap,
}

impl Lifecycle {
    pub fn select<T>(self, mut pending: Vec<T>, retries: impl Fn(&T) -> u32) -> Vec<T> {
        match self {
            Lifecycle::AllAtOnce => pending,
            Lifecycle::OneByOne => {
                pending.truncate(1);
                pending
            }
            Lifecycle::Randomized => {
                if pending.is_empty() {
                    return pending;
                }
                let i = rand::thread_rng().gen_range(0..pending.len());
                vec![pending.swap_remove(i)]
            }
            Lifecycle::Shuffled => {
                pending.shuffle(&mut rand::thread_rng());
                pending
            }
            Lifecycle::Asap => {
                // Stable: equal retries keep registration order.
                pending.sort_by_key(|h| retries(h));
                pending.truncate(1);
                pending
            }
        }
    }
}

impl std::str::FromStr for Lifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "allatonce" => Ok(Lifecycle::AllAtOnce),
            "onebyone" => Ok(Lifecycle::OneByOne),
            "randomized" | "random" => Ok(Lifecycle::Randomized),
            "shuffled" => Ok(Lifecycle::Shuffled),
            "asap" => Ok(Lifecycle::Asap),
            other => Err(format!("unknown lifecycle: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retries(h: &(&str, u32)) -> u32 {
        h.1
    }

    #[test]
    fn asap_prefers_the_least_retried_then_registration_order() {
        let pending = vec![("a", 2), ("b", 1), ("c", 1)];
        assert_eq!(Lifecycle::Asap.select(pending, retries), vec![("b", 1)]);
    }

    #[test]
    fn ordered_policies() {
        let pending = vec![("a", 0), ("b", 0)];
        assert_eq!(Lifecycle::AllAtOnce.select(pending.clone(), retries), pending);
        assert_eq!(Lifecycle::OneByOne.select(pending.clone(), retries), vec![("a", 0)]);
    }

    #[test]
    fn random_policies_keep_the_set() {
        let pending = vec![("a", 0), ("b", 0), ("c", 0)];
        let one = Lifecycle::Randomized.select(pending.clone(), retries);
        assert_eq!(one.len(), 1);
        assert!(pending.contains(&one[0]));
        let mut all = Lifecycle::Shuffled.select(pending.clone(), retries);
        all.sort();
        assert_eq!(all, pending);
        assert!(Lifecycle::Randomized.select(Vec::<(&str, u32)>::new(), retries).is_empty());
    }

    #[test]
    fn parses_names() {
        assert_eq!("all_at_once".parse::<Lifecycle>().unwrap(), Lifecycle::AllAtOnce);
        assert_eq!("one-by-one".parse::<Lifecycle>().unwrap(), Lifecycle::OneByOne);
        assert!("nope".parse::<Lifecycle>().is_err());
    }
}

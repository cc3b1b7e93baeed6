use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::{ExitOperationsCollector, ExitStrategy, require_shard};
use crate::error::{ShardError, ShardResult};
use crate::shard::ShardRef;

/// Numeric value that can be folded across shards.
///
/// Integer sums and counts that leave the type's range yield `None` instead
/// of wrapping.
pub trait Aggregatable: Copy + PartialOrd + Send + 'static {
    fn zero() -> Self;

    fn checked_add(self, other: Self) -> Option<Self>;

    fn from_count(count: u64) -> Option<Self>;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_aggregatable_int {
    ($($ty:ty),*) => {
        $(
            impl Aggregatable for $ty {
                #[inline]
                fn zero() -> Self {
                    0
                }

                #[inline]
                fn checked_add(self, other: Self) -> Option<Self> {
                    <$ty>::checked_add(self, other)
                }

                #[inline]
                fn from_count(count: u64) -> Option<Self> {
                    <$ty>::try_from(count).ok()
                }

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(value: f64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

macro_rules! impl_aggregatable_float {
    ($($ty:ty),*) => {
        $(
            impl Aggregatable for $ty {
                #[inline]
                fn zero() -> Self {
                    0.0
                }

                #[inline]
                fn checked_add(self, other: Self) -> Option<Self> {
                    Some(self + other)
                }

                #[inline]
                fn from_count(count: u64) -> Option<Self> {
                    Some(count as $ty)
                }

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(value: f64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_aggregatable_int!(i32, i64, u32, u64);
impl_aggregatable_float!(f32, f64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl FromStr for AggregateFunction {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(AggregateFunction::Sum),
            "count" => Ok(AggregateFunction::Count),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "avg" => Ok(AggregateFunction::Avg),
            other => Err(ShardError::configuration(format!(
                "unknown aggregate function `{}`",
                other
            ))),
        }
    }
}

struct Running<T> {
    sum: T,
    float_sum: f64,
    count: u64,
    min: Option<T>,
    max: Option<T>,
}

/// Folds scalar shard results with one [`AggregateFunction`].
///
/// Null results are skipped. Never stops dispatch.
pub struct AggregateExitStrategy<T> {
    function: AggregateFunction,
    running: Mutex<Running<T>>,
}

impl<T: Aggregatable> AggregateExitStrategy<T> {
    pub fn new(function: AggregateFunction) -> Self {
        Self {
            function,
            running: Mutex::new(Running {
                sum: T::zero(),
                float_sum: 0.0,
                count: 0,
                min: None,
                max: None,
            }),
        }
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    fn running(&self) -> MutexGuard<'_, Running<T>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Aggregatable> ExitStrategy<T> for AggregateExitStrategy<T> {
    type Output = Option<T>;

    fn add_result(
        &self,
        result: Option<T>,
        shard: Option<&ShardRef>,
    ) -> ShardResult<bool> {
        require_shard(shard)?;
        if let Some(value) = result {
            let mut running = self.running();
            if self.function == AggregateFunction::Sum {
                running.sum =
                    running.sum.checked_add(value).ok_or_else(|| {
                        ShardError::overflow(
                            "sum of shard results does not fit the result type",
                        )
                    })?;
            }
            running.float_sum += value.to_f64();
            running.count += 1;
            if running.min.is_none_or(|min| value < min) {
                running.min = Some(value);
            }
            if running.max.is_none_or(|max| value > max) {
                running.max = Some(value);
            }
        }
        Ok(false)
    }

    fn compile_results(
        &self,
        collector: Option<&dyn ExitOperationsCollector<Option<T>>>,
    ) -> ShardResult<Option<T>> {
        let running = self.running();
        let result = match self.function {
            AggregateFunction::Sum => Some(running.sum),
            AggregateFunction::Count => {
                Some(T::from_count(running.count).ok_or_else(|| {
                    ShardError::overflow(format!(
                        "count {} does not fit the result type",
                        running.count
                    ))
                })?)
            }
            AggregateFunction::Min => running.min,
            AggregateFunction::Max => running.max,
            AggregateFunction::Avg if running.count == 0 => None,
            AggregateFunction::Avg => Some(T::from_f64(
                running.float_sum / running.count as f64,
            )),
        };
        drop(running);
        match collector {
            Some(collector) => collector.apply(result),
            None => Ok(result),
        }
    }
}

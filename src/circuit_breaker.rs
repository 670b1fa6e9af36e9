use failsafe::{backoff, failure_policy, Config};
use std::time::Duration;

/// Creates the circuit breaker guarding merge commits against the record store.
///
/// # Configuration
///
/// - **Failure threshold**: `failure_threshold` consecutive failed commits open the circuit.
/// - **Backoff**: Exponential backoff from 10s to 60s before a trial commit.
///
/// While the circuit is open every commit is rejected without touching the
/// store, and the executor treats the rejection as total resource exhaustion.
///
/// # Example
///
/// ```rust
/// use contact_compliance::circuit_breaker::create_store_circuit_breaker;
/// use failsafe::CircuitBreaker;
///
/// let breaker = create_store_circuit_breaker(5);
/// let committed: Result<(), failsafe::Error<&str>> = breaker.call(|| Ok(()));
/// assert!(committed.is_ok());
/// ```
pub fn create_store_circuit_breaker(failure_threshold: u32) -> impl failsafe::CircuitBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(failure_threshold, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

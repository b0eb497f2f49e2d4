use crate::{context::HealthSettings, errors::OrchestratorError};

/// Poll the readiness url until it answers with success
///
/// Makes at most `settings.attempts` requests, `settings.interval` apart.
/// Returns the number of the attempt that succeeded.
pub async fn wait_until_ready(settings: &HealthSettings) -> Result<u32, OrchestratorError> {
    let client = reqwest::Client::builder()
        .connect_timeout(settings.timeout)
        .timeout(settings.timeout)
        .build()?;
    for attempt in 1..=settings.attempts {
        match client.get(settings.url.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                log::info!("{} ready after {} attempts", settings.url, attempt);
                return Ok(attempt);
            }
            Ok(response) => log::debug!(
                "health check {}/{}: status {}",
                attempt,
                settings.attempts,
                response.status()
            ),
            Err(err) => log::debug!(
                "health check {}/{}: {}",
                attempt,
                settings.attempts,
                err
            ),
        }
        if attempt < settings.attempts {
            tokio::time::sleep(settings.interval).await;
        }
    }
    Err(OrchestratorError::HealthTimeout {
        attempts: settings.attempts,
    })
}

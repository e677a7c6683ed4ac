use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use banana_contracts::errors::{GenerationError, GenerationErrorKind};
use banana_contracts::events::{EventPayload, EventWriter};
use banana_contracts::image::Image;
use banana_contracts::payload;
use banana_contracts::request::GenerationRequest;
use banana_contracts::resolution::reduced_ratio;
use rand::Rng;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::credentials::Credentials;
use crate::transport::{GenerationTransport, HttpTransport, TransportError, WireResponse};
use crate::wire::{extract_image, truncate_text, WirePayload};

/// Exponential backoff: `min(base * 2^retry, max) * (1 + U[0, jitter])`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl BackoffPolicy {
    /// `sample` is a uniform draw in `[0, 1]`.
    pub fn delay(&self, retry: u32, sample: f64) -> Duration {
        let factor = 2f64.powi(retry.min(30) as i32);
        let raw = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        Duration::from_secs_f64(raw * (1.0 + jitter))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    pub overall_timeout: Duration,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub frame_prompts: bool,
    pub conform_output: bool,
}

impl ClientSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            overall_timeout: config.overall_timeout(),
            max_retries: config.max_retries,
            backoff: BackoffPolicy {
                base: Duration::from_secs_f64(config.retry_backoff_s),
                max: Duration::from_secs_f64(config.retry_backoff_max_s),
                jitter: config.retry_jitter,
            },
            frame_prompts: config.frame_prompts,
            conform_output: config.conform_output,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Drives one generation call through the transport: credential check,
/// retries with backoff, an overall deadline and cancellation.
#[derive(Clone)]
pub struct GenerationClient {
    transport: Arc<dyn GenerationTransport>,
    settings: ClientSettings,
    events: Option<EventWriter>,
}

enum Attempt {
    Transient {
        status: Option<u16>,
        retry_after: Option<Duration>,
        reason: String,
    },
    Done(Result<Image, GenerationError>),
}

impl GenerationClient {
    pub fn new(transport: Arc<dyn GenerationTransport>, settings: ClientSettings) -> Self {
        Self {
            transport,
            settings,
            events: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), ClientSettings::from_config(config)))
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<Image, GenerationError> {
        let outcome = self.generate_inner(request, credentials, cancel).await;
        match &outcome {
            Ok(image) => {
                let (width, height) = image.dimensions();
                self.emit(
                    "generation_succeeded",
                    payload! {
                        "mode" => request.mode().as_str(),
                        "width" => width,
                        "height" => height,
                        "image" => image.handle().as_str(),
                    },
                );
            }
            Err(err) => self.emit(
                "generation_failed",
                payload! {
                    "mode" => request.mode().as_str(),
                    "kind" => err.kind.as_str(),
                    "message" => err.message.as_str(),
                    "status" => err.status,
                    "attempts" => err.attempts,
                },
            ),
        }
        outcome
    }

    async fn generate_inner(
        &self,
        request: &GenerationRequest,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<Image, GenerationError> {
        credentials.validate()?;
        if cancel.is_cancelled() {
            return Err(GenerationError::cancelled());
        }

        let payload = WirePayload::from_request(request, self.settings.frame_prompts)
            .map_err(|err| {
                GenerationError::new(
                    GenerationErrorKind::RequestRejected,
                    format!("failed to encode request images: {err:#}"),
                )
            })?;
        let (target_w, target_h) = payload.target;
        let roles: Vec<&str> = payload.images.iter().map(|image| image.role.as_str()).collect();
        self.emit(
            "request_built",
            payload! {
                "mode" => payload.mode.as_str(),
                "target" => [target_w, target_h],
                "image_size" => payload.image_size.as_str(),
                "aspect_ratio" => payload.aspect_ratio,
                "target_ratio" => reduced_ratio(target_w, target_h),
                "images" => roles,
                "prompt_chars" => payload.text.chars().count(),
            },
        );

        let attempts = AtomicU32::new(0);
        let overall = self.settings.overall_timeout;
        let attempt_loop = self.attempt_loop(&payload, credentials, &attempts);
        let image = tokio::select! {
            _ = cancel.cancelled() => {
                Err(GenerationError::cancelled().with_attempts(attempts.load(Ordering::SeqCst)))
            }
            outcome = tokio::time::timeout(overall, attempt_loop) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::new(
                        GenerationErrorKind::Timeout,
                        format!("no result within {:.0}s", overall.as_secs_f64()),
                    )
                    .with_attempts(attempts.load(Ordering::SeqCst))),
                }
            }
        }?;

        Ok(self.conform(image, payload.target))
    }

    async fn attempt_loop(
        &self,
        payload: &WirePayload,
        credentials: &Credentials,
        attempts: &AtomicU32,
    ) -> Result<Image, GenerationError> {
        let max_attempts = self.settings.max_retries + 1;
        let mut retry = 0u32;
        loop {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.emit(
                "generation_attempt",
                payload! { "attempt" => attempt, "max_attempts" => max_attempts },
            );

            let sent = tokio::time::timeout(
                self.settings.request_timeout,
                self.transport
                    .send(payload, credentials, self.settings.request_timeout),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout(self.settings.request_timeout)));

            let (status, retry_after, reason) = match classify(sent, attempt) {
                Attempt::Done(result) => return result,
                Attempt::Transient {
                    status,
                    retry_after,
                    reason,
                } => (status, retry_after, reason),
            };

            if retry >= self.settings.max_retries {
                let mut err = GenerationError::new(
                    GenerationErrorKind::TransientExhausted,
                    format!("gave up after {attempt} attempts: {reason}"),
                )
                .with_attempts(attempt);
                if let Some(status) = status {
                    err = err.with_status(status);
                }
                return Err(err);
            }

            let sample = if self.settings.backoff.jitter > 0.0 {
                rand::thread_rng().gen_range(0.0..=1.0)
            } else {
                0.0
            };
            let backoff = self.settings.backoff.delay(retry, sample);
            let delay = retry_after.map_or(backoff, |server| server.max(backoff));
            self.emit(
                "generation_retry",
                payload! {
                    "attempt" => attempt,
                    "retry" => retry + 1,
                    "delay_ms" => delay.as_millis() as u64,
                    "status" => status,
                    "reason" => reason,
                },
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    fn conform(&self, image: Image, target: (u32, u32)) -> Image {
        if !self.settings.conform_output || image.dimensions() == target {
            return image;
        }
        let (from_w, from_h) = image.dimensions();
        let conformed = image.resized_exact(target.0, target.1);
        self.emit(
            "output_conformed",
            payload! { "from" => [from_w, from_h], "to" => [target.0, target.1] },
        );
        conformed
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Some(events) = self.events.as_ref() {
            events.record(event_type, payload);
        }
    }
}

fn classify(sent: Result<WireResponse, TransportError>, attempt: u32) -> Attempt {
    let response = match sent {
        Ok(response) => response,
        Err(err) if err.is_retryable() => {
            return Attempt::Transient {
                status: None,
                retry_after: None,
                reason: err.to_string(),
            }
        }
        Err(err) => {
            return Attempt::Done(Err(GenerationError::new(
                GenerationErrorKind::RequestRejected,
                err.to_string(),
            )
            .with_attempts(attempt)))
        }
    };

    let status = response.status;
    if response.is_success() {
        return Attempt::Done(decode(&response.body).map_err(|err| err.with_attempts(attempt)));
    }

    let snippet = truncate_text(String::from_utf8_lossy(&response.body).trim(), 512);
    match status {
        429 | 500..=599 => Attempt::Transient {
            status: Some(status),
            retry_after: response.retry_after,
            reason: format!("service returned {status}: {snippet}"),
        },
        401 | 403 => Attempt::Done(Err(GenerationError::new(
            GenerationErrorKind::AuthInvalid,
            format!("service refused the API key ({status}): {snippet}"),
        )
        .with_status(status)
        .with_attempts(attempt))),
        _ => Attempt::Done(Err(GenerationError::new(
            GenerationErrorKind::RequestRejected,
            format!("service rejected the request ({status}): {snippet}"),
        )
        .with_status(status)
        .with_attempts(attempt))),
    }
}

fn decode(body: &[u8]) -> Result<Image, GenerationError> {
    let decode_failed = |err: anyhow::Error| {
        GenerationError::new(GenerationErrorKind::DecodeFailed, format!("{err:#}"))
    };
    let bytes = extract_image(body).map_err(decode_failed)?;
    let image = Image::decode(&bytes).map_err(decode_failed)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(GenerationError::new(
            GenerationErrorKind::DecodeFailed,
            "decoded image has a zero dimension",
        ));
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use banana_contracts::image::Mask;
    use banana_contracts::request::{GenerationMode, RequestBuilder};
    use banana_contracts::resolution::ResolutionTier;

    use super::*;
    use crate::testing::{image_response, solid, status, ScriptedTransport, Step};

    fn settings() -> ClientSettings {
        ClientSettings {
            request_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(300),
            max_retries: 3,
            backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(20),
                jitter: 0.0,
            },
            frame_prompts: true,
            conform_output: true,
        }
    }

    fn client(transport: &Arc<ScriptedTransport>, settings: ClientSettings) -> GenerationClient {
        GenerationClient::new(transport.clone(), settings).with_events(EventWriter::memory("test"))
    }

    fn request() -> GenerationRequest {
        RequestBuilder::new(GenerationMode::FullEdit, "make it dusk")
            .base_image(solid(32, 32, [10, 10, 10]))
            .build()
            .expect("valid request")
    }

    fn key() -> Credentials {
        Credentials::new("test-key")
    }

    #[test]
    fn backoff_doubles_until_the_ceiling() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.5,
        };
        assert_eq!(policy.delay(0, 0.0), Duration::from_secs(1));
        assert_eq!(policy.delay(1, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay(2, 0.0), Duration::from_secs(4));
        assert_eq!(policy.delay(3, 0.0), Duration::from_secs(5));
        assert_eq!(policy.delay(0, 1.0), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_retried_with_growing_gaps() -> anyhow::Result<()> {
        let result = solid(32, 32, [200, 0, 0]);
        let transport = Arc::new(ScriptedTransport::new([
            Step::Respond(status(429)),
            Step::Respond(status(429)),
            Step::Respond(image_response(&result)),
        ]));
        let client = client(&transport, settings());

        let image = client.generate(&request(), &key(), &CancelToken::new()).await?;
        assert_eq!(image, result);
        assert_eq!(transport.calls(), 3);

        let times = transport.call_times();
        let first_gap = times[1] - times[0];
        let second_gap = times[2] - times[1];
        assert!(first_gap >= Duration::from_secs(1));
        assert!(second_gap > first_gap);

        let events = client.events.as_ref().expect("events").captured_types();
        assert_eq!(events.iter().filter(|ty| *ty == "generation_retry").count(), 2);
        assert_eq!(events.last().map(String::as_str), Some("generation_succeeded"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_raises_the_delay() -> anyhow::Result<()> {
        let mut limited = status(429);
        limited.retry_after = Some(Duration::from_secs(7));
        let transport = Arc::new(ScriptedTransport::new([
            Step::Respond(limited),
            Step::Respond(image_response(&solid(32, 32, [1, 2, 3]))),
        ]));
        client(&transport, settings())
            .generate(&request(), &key(), &CancelToken::new())
            .await?;
        let times = transport.call_times();
        assert!(times[1] - times[0] >= Duration::from_secs(7));
        Ok(())
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::new([Step::Respond(status(400))]));
        let err = client(&transport, settings())
            .generate(&request(), &key(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::RequestRejected);
        assert_eq!(err.status, Some(400));
        assert_eq!(err.attempts, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn refused_keys_are_auth_invalid_without_retry() {
        let transport = Arc::new(ScriptedTransport::new([Step::Respond(status(403))]));
        let err = client(&transport, settings())
            .generate(&request(), &key(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::AuthInvalid);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_credentials_never_reach_the_network() {
        let transport = Arc::new(ScriptedTransport::new([]));
        let client = client(&transport, settings());
        let err = client
            .generate(&request(), &Credentials::new("has space"), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::AuthInvalid);
        assert_eq!(transport.calls(), 0);

        let logged = client.events.as_ref().expect("events").captured();
        assert!(!serde_json::to_string(&logged).unwrap_or_default().contains("has space"));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_exhaust_retries() {
        let transport = Arc::new(ScriptedTransport::new([
            Step::Respond(status(503)),
            Step::Fail(TransportError::Connect("reset by peer".to_string())),
            Step::Respond(status(500)),
        ]));
        let err = client(
            &transport,
            ClientSettings {
                max_retries: 2,
                ..settings()
            },
        )
        .generate(&request(), &key(), &CancelToken::new())
        .await
        .unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::TransientExhausted);
        assert_eq!(err.status, Some(500));
        assert_eq!(err.attempts, 3);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_cuts_retries_short() {
        let transport = Arc::new(ScriptedTransport::new([
            Step::Hang,
            Step::Hang,
            Step::Hang,
        ]));
        let err = client(
            &transport,
            ClientSettings {
                request_timeout: Duration::from_secs(5),
                overall_timeout: Duration::from_secs(12),
                max_retries: 8,
                ..settings()
            },
        )
        .generate(&request(), &key(), &CancelToken::new())
        .await
        .unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::Timeout);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_mid_flight_drops_the_call() {
        let transport = Arc::new(ScriptedTransport::new([Step::Hang]));
        let client = client(&transport, settings());
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = client
            .generate(&request(), &key(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn text_only_answers_are_decode_failures() {
        let refusal = WireResponse {
            status: 200,
            body: br#"{"candidates":[{"content":{"parts":[{"text":"I cannot draw that."}]}}]}"#
                .to_vec(),
            retry_after: None,
        };
        let transport = Arc::new(ScriptedTransport::new([Step::Respond(refusal)]));
        let err = client(&transport, settings())
            .generate(&request(), &key(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::DecodeFailed);
        assert!(err.message.contains("I cannot draw that."));
    }

    #[tokio::test]
    async fn output_is_conformed_to_the_target() -> anyhow::Result<()> {
        let request = RequestBuilder::new(GenerationMode::Inpaint, "patch the wall")
            .base_image(solid(64, 48, [5, 5, 5]))
            .mask(Mask::from_rect(64, 48, (0, 0, 10, 10)))
            .resolution(ResolutionTier::Auto)
            .build()?;

        let transport = Arc::new(ScriptedTransport::new([Step::Respond(image_response(
            &solid(128, 96, [9, 9, 9]),
        ))]));
        let conforming = client(&transport, settings());
        let image = conforming
            .generate(&request, &key(), &CancelToken::new())
            .await?;
        assert_eq!(image.dimensions(), (64, 48));
        let built = conforming
            .events
            .as_ref()
            .expect("events")
            .captured()
            .into_iter()
            .find(|event| event["type"] == "request_built")
            .expect("request_built logged");
        assert_eq!(built["target_ratio"], "4:3");
        assert_eq!(built["aspect_ratio"], "4:3");

        let transport = Arc::new(ScriptedTransport::new([Step::Respond(image_response(
            &solid(128, 96, [9, 9, 9]),
        ))]));
        let image = client(
            &transport,
            ClientSettings {
                conform_output: false,
                ..settings()
            },
        )
        .generate(&request, &key(), &CancelToken::new())
        .await?;
        assert_eq!(image.dimensions(), (128, 96));
        Ok(())
    }
}

//! Scenario gun
//!
//! Fires every step of a scenario ammo in order over the pool's shared
//! HTTP/1.1 client. Each step reports one sample tagged
//! `<scenario>.<step tag>`; the first failed step ends the scenario.

use super::postprocessor::PostprocessError;
use super::template::Field;
use super::vars::{store_step_output, Vars};
use super::{RequestStep, Scenario, Step};
use crate::ammo::{Ammo, HttpRequestSpec, Payload};
use crate::gun::http::{self, build_client, HttpResponse, HttpShared, Protocol};
use crate::gun::{report_unfired, Gun, GunDeps, GunFactory, HttpGunConfig, SharedState};
use crate::provider::split_absolute_uri;
use crate::sample::{Sample, SampleError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

pub struct ScenarioGunFactory {
    cfg: HttpGunConfig,
}

impl ScenarioGunFactory {
    pub fn new(cfg: HttpGunConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl GunFactory for ScenarioGunFactory {
    fn accepts(&self, payload_kind: &str) -> bool {
        payload_kind == "scenario"
    }

    async fn warm_up(&self, _cancel: &CancellationToken) -> anyhow::Result<SharedState> {
        Ok(Arc::new(HttpShared {
            client: build_client(&self.cfg, Protocol::Http1)?,
            base_url: self.cfg.base_url(),
            timeout: self.cfg.timeout,
        }))
    }

    fn new_gun(&self, deps: GunDeps) -> anyhow::Result<Box<dyn Gun>> {
        let shared = Arc::clone(&deps.shared)
            .downcast::<HttpShared>()
            .map_err(|_| anyhow::anyhow!("scenario gun got foreign shared state"))?;
        Ok(Box::new(ScenarioGun { deps, shared }))
    }
}

pub struct ScenarioGun {
    deps: GunDeps,
    shared: Arc<HttpShared>,
}

enum StepOutcome {
    Done,
    Failed,
    Cancelled,
}

impl ScenarioGun {
    async fn run(&self, ammo_id: u64, scenario: &Scenario) {
        let started = Instant::now();
        let mut request = Value::Object(Map::new());

        for step in &scenario.steps {
            if self.deps.cancel.is_cancelled() {
                return;
            }
            match self.fire_step(scenario, step, &mut request).await {
                StepOutcome::Done => {}
                StepOutcome::Failed => {
                    debug!(parent: &self.deps.span, ammo_id, scenario = %scenario.name, step = %step.request.name, "Scenario aborted");
                    return;
                }
                StepOutcome::Cancelled => return,
            }
            if !self.pause(step.sleep).await {
                return;
            }
        }

        let spent = started.elapsed();
        if spent < scenario.min_waiting_time {
            self.pause(scenario.min_waiting_time - spent).await;
        }
    }

    /// Sleep unless cancelled first; false when cancelled
    async fn pause(&self, d: Duration) -> bool {
        if d.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.deps.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    async fn fire_step(&self, scenario: &Scenario, step: &Step, request: &mut Value) -> StepOutcome {
        let req = &step.request;

        // The sample clock starts once the request is composed
        let spec = match compose(scenario, req, request) {
            Ok(spec) => spec,
            Err(e) => {
                let mut sample = Sample::start(scenario.step_tag(step));
                sample.set_error(e);
                sample.finish();
                self.deps.reporter.report(sample).await;
                return StepOutcome::Failed;
            }
        };
        let mut sample = Sample::start(scenario.step_tag(step));

        let sent = tokio::select! {
            _ = self.deps.cancel.cancelled() => return StepOutcome::Cancelled,
            r = http::send(&self.shared, &spec, &mut sample) => r,
        };

        let result = sent.and_then(|response| postprocess(req, &response));

        let outcome = match result {
            Ok(extracted) => {
                if !req.postprocessors.is_empty() {
                    store_step_output(request, &req.name, "postprocessor", extracted, true);
                }
                StepOutcome::Done
            }
            Err(e) => {
                sample.set_error(e);
                StepOutcome::Failed
            }
        };
        sample.finish();
        self.deps.reporter.report(sample).await;
        outcome
    }
}

/// Check every assertion, then run the extractors in config order
fn postprocess(req: &RequestStep, response: &HttpResponse) -> Result<Map<String, Value>, SampleError> {
    let (asserts, extractors): (Vec<_>, Vec<_>) = req.postprocessors.iter().partition(|pp| pp.is_assertion());
    let mut extracted = Map::new();
    for pp in asserts.into_iter().chain(extractors) {
        let values = pp.process(response).map_err(|e| match e {
            PostprocessError::Assertion(msg) => SampleError::Assertion(msg),
            PostprocessError::Extraction(msg) => SampleError::Scenario(format!("{}: {}", req.name, msg)),
        })?;
        extracted.extend(values);
    }
    Ok(extracted)
}

/// Run the preprocessor and render the request templates
fn compose(scenario: &Scenario, req: &RequestStep, request: &mut Value) -> Result<HttpRequestSpec, SampleError> {
    if !req.preprocessor.is_empty() {
        let values = req
            .preprocessor
            .run(&Vars::new(&scenario.storage, request))
            .map_err(|e| SampleError::Scenario(format!("{}: {}", req.name, e)))?;
        store_step_output(request, &req.name, "preprocessor", values, false);
    }

    let vars = Vars::new(&scenario.storage, request);
    let render = |field: Field, source: &str| {
        scenario
            .templates
            .get_or_compile(&scenario.name, &req.name, field, source)
            .and_then(|t| t.render(&vars, req.templater))
            .map_err(|e| SampleError::Scenario(format!("{}: {}", req.name, e)))
    };

    let (host, uri) = split_absolute_uri(&render(Field::Uri, &req.uri)?);
    let mut spec = HttpRequestSpec::get(uri);
    spec.method = req.method.clone();
    spec.host = host;
    for (name, value) in &req.headers {
        let value = render(Field::Header(name.clone()), value)?;
        spec.set_header(name, &value);
    }
    if let Some(ref body) = req.body {
        spec.body = Bytes::from(render(Field::Body, body)?);
    }
    Ok(spec)
}

#[async_trait]
impl Gun for ScenarioGun {
    async fn shoot(&mut self, ammo: &Ammo) {
        if let Some(ref reason) = ammo.invalid {
            report_unfired(&self.deps.reporter, ammo, SampleError::InvalidAmmo(reason.clone())).await;
            return;
        }
        let Payload::Scenario(ref scenario) = ammo.payload else {
            report_unfired(&self.deps.reporter, ammo, SampleError::UnsupportedAmmo(ammo.payload.kind())).await;
            return;
        };
        let span = self.deps.span.clone();
        self.run(ammo.id, scenario).instrument(span).await;
    }
}

//! Multi-step HTTP scenarios
//!
//! A scenario file declares variable sources, named requests and weighted
//! scenarios built from those requests:
//!
//! ```yaml
//! variable_sources:
//!   - type: file/csv
//!     name: users
//!     file: users.csv
//!     fields: [user_id, name]
//!     ignore_first_line: true
//! requests:
//!   - name: auth
//!     method: POST
//!     uri: /auth
//!     body: '{"user_id": {{ .request.auth.preprocessor.user_id }}}'
//!     preprocessor:
//!       mapping:
//!         user_id: source.users[next].user_id
//!     postprocessors:
//!       - type: var/jsonpath
//!         mapping:
//!           token: $.auth_key
//!       - type: assert/response
//!         status_code: 200
//!   - name: list
//!     uri: /list
//!     headers:
//!       Authorization: Bearer {{ .request.auth.token }}
//! scenarios:
//!   - name: basic
//!     weight: 3
//!     min_waiting_time: 500
//!     requests:
//!       - auth
//!       - sleep(100)
//!       - list(2, 50)
//! ```
//!
//! Every scenario of a file shares one [`vars::VariableStorage`] and one
//! [`template::TemplateCache`], so `[next]` iterators advance pool-wide.

pub mod file;
pub mod gun;
pub mod postprocessor;
pub mod preprocessor;
pub mod sources;
pub mod template;
pub mod vars;

use postprocessor::Postprocessor;
use preprocessor::Preprocessor;
use std::sync::Arc;
use std::time::Duration;
use template::{TemplateCache, TemplaterKind};
use vars::VariableStorage;

/// Scenario ready to be fired
#[derive(Debug)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<Step>,
    /// Minimum wall time of one scenario run
    pub min_waiting_time: Duration,
    pub storage: Arc<VariableStorage>,
    pub templates: Arc<TemplateCache>,
}

/// One request of a scenario plus the pause after it
#[derive(Debug, Clone)]
pub struct Step {
    pub request: Arc<RequestStep>,
    pub sleep: Duration,
}

/// Compiled request definition
#[derive(Debug)]
pub struct RequestStep {
    pub name: String,
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Sample tag suffix; the request name when not set
    pub tag: String,
    pub templater: TemplaterKind,
    pub preprocessor: Preprocessor,
    pub postprocessors: Vec<Postprocessor>,
}

impl Scenario {
    /// Sample tag of a step: `<scenario>.<step tag>`
    pub fn step_tag(&self, step: &Step) -> String {
        format!("{}.{}", self.name, step.request.tag)
    }
}

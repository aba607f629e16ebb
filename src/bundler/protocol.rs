//! Host message protocol: the JSON-compatible messages exchanged with
//! the embedding frame. The transport itself is an external
//! collaborator; the bundler only produces and consumes these types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One file in a compile request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    pub path: String,
    pub code: String,
}

/// Messages the host sends to the bundler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    Compile {
        modules: BTreeMap<String, ModuleSource>,
        template: String,
        #[serde(default)]
        has_file_resolver: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_level: Option<String>,
        /// Host override for the preset's HMR default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hmr: Option<bool>,
    },
    Refresh,
    Evaluate {
        command: String,
    },
    FsResponse {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Compile status transitions, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Initializing,
    InstallingDependencies,
    Transpiling,
    Evaluating,
    Done,
    Error,
}

/// Snapshot entry for one transpiled module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspiledModuleSource {
    pub is_entry: bool,
    pub file_name: String,
    pub compiled_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranspiledModule {
    pub source: TranspiledModuleSource,
}

/// Snapshot of the module map. Keys keep the historical `<path>:` form
/// for compatibility with existing consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlerState {
    pub transpiled_modules: BTreeMap<String, TranspiledModule>,
}

/// Stack frame attached to an error action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub line_number: u32,
    #[serde(default)]
    pub column_number: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub frames: Vec<ErrorFrame>,
}

/// One captured console record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleRecord {
    pub method: String,
    pub data: Vec<String>,
}

/// Messages the bundler sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    Initialized,
    Start {
        first_load: bool,
    },
    Status {
        status: Status,
    },
    State {
        state: BundlerState,
    },
    /// The field name's spelling is load-bearing: existing consumers
    /// read `compilatonError`.
    Done {
        compilaton_error: bool,
    },
    Success,
    Action {
        action: String,
        title: String,
        #[serde(default)]
        line: u32,
        #[serde(default)]
        column: u32,
        path: String,
        message: String,
        payload: ErrorPayload,
    },
    Console {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log: Option<Vec<ConsoleRecord>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Resize {
        height: u32,
    },
    Refresh,
    FsRequest {
        request_id: u64,
        path: String,
    },
}

impl OutboundMessage {
    /// The standard show-error action for a compile or runtime failure.
    pub fn show_error(title: &str, path: &str, message: &str) -> Self {
        OutboundMessage::Action {
            action: "show-error".to_string(),
            title: title.to_string(),
            line: 0,
            column: 0,
            path: path.to_string(),
            message: message.to_string(),
            payload: ErrorPayload::default(),
        }
    }
}

/// One file of a serialized bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub code: String,
}

/// The bundle file format exchanged with the static bundle server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub files: BTreeMap<String, BundleEntry>,
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use prost_reflect::{DescriptorPool, MessageDescriptor, MethodDescriptor};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{MockwireError, Result};

/// Per-method metadata used by the shared handler and the adapters.
///
/// One entry exists for every method of every service in the loaded schema.
/// `rule_key` is the lower-cased `package.service.method` join used to index
/// rule documents.
#[derive(Debug, Clone)]
pub struct HandlerMeta {
    /// Fully qualified service name, e.g. `helloworld.Greeter`.
    pub service: String,
    /// Bare method name, e.g. `SayHello`.
    pub method: String,
    pub request: MessageDescriptor,
    pub response: MessageDescriptor,
    pub client_streaming: bool,
    pub server_streaming: bool,
    pub rule_key: String,
}

impl HandlerMeta {
    fn from_method(method: &MethodDescriptor) -> Self {
        let service = method.parent_service().full_name().to_string();
        let name = method.name().to_string();
        let rule_key = rule_key(&service, &name);
        HandlerMeta {
            service,
            method: name,
            request: method.input(),
            response: method.output(),
            client_streaming: method.is_client_streaming(),
            server_streaming: method.is_server_streaming(),
            rule_key,
        }
    }

    /// The HTTP/2 request path for this method: `/package.Service/Method`.
    pub fn grpc_path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Compute the rule key for a service + method pair.
///
/// Lower-casing happens here, on the schema side; the rule store applies the
/// same transform to file names, so the two always agree.
pub fn rule_key(service: &str, method: &str) -> String {
    format!("{service}.{method}").to_lowercase()
}

/// Outcome of loading one proto directory: which top-level files parsed and
/// which were skipped (with the parser's error text).
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub file: String,
    pub error: String,
}

/// The immutable-per-reload type registry: descriptor pool, per-method
/// handler metadata, and the load report.
#[derive(Debug, Clone)]
pub struct SchemaSet {
    pool: DescriptorPool,
    /// rule key -> method metadata.
    methods: BTreeMap<String, HandlerMeta>,
    /// `/package.Service/Method` -> rule key, for adapter path dispatch.
    paths: BTreeMap<String, String>,
    report: LoadReport,
}

impl Default for SchemaSet {
    fn default() -> Self {
        SchemaSet::empty()
    }
}

impl SchemaSet {
    /// An empty schema: the server runs but serves no RPCs.
    pub fn empty() -> Self {
        SchemaSet {
            pool: DescriptorPool::new(),
            methods: BTreeMap::new(),
            paths: BTreeMap::new(),
            report: LoadReport::default(),
        }
    }

    fn from_pool(pool: DescriptorPool, report: LoadReport) -> Self {
        let mut methods = BTreeMap::new();
        let mut paths = BTreeMap::new();
        for service in pool.services() {
            for method in service.methods() {
                let meta = HandlerMeta::from_method(&method);
                paths.insert(meta.grpc_path(), meta.rule_key.clone());
                methods.insert(meta.rule_key.clone(), meta);
            }
        }
        SchemaSet {
            pool,
            methods,
            paths,
            report,
        }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// All fully qualified service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pool
            .services()
            .map(|s| s.full_name().to_string())
            .collect();
        names.sort();
        names
    }

    /// All rule keys derivable from the schema, sorted.
    pub fn rule_keys(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn methods(&self) -> impl Iterator<Item = &HandlerMeta> {
        self.methods.values()
    }

    /// Look up a method by its HTTP/2 request path (`/pkg.Service/Method`).
    pub fn method_by_path(&self, path: &str) -> Option<&HandlerMeta> {
        self.paths.get(path).and_then(|key| self.methods.get(key))
    }

    /// Look up a method by service + method name, case-insensitively.
    pub fn method_by_name(&self, service: &str, method: &str) -> Option<&HandlerMeta> {
        self.methods.get(&rule_key(service, method))
    }

    /// Total number of message types in the pool (validation coverage
    /// denominator).
    pub fn message_type_count(&self) -> usize {
        self.pool.all_messages().count()
    }
}

/// Load all top-level `.proto` files in `proto_dir` into a schema set.
///
/// Tries a bulk compile first. When that fails, each top-level file is
/// compiled independently so a single malformed file only skips itself.
/// This function never fails: an unreadable directory yields an empty
/// schema with the error recorded against the directory.
pub fn load_dir(proto_dir: &Path) -> SchemaSet {
    let files = match list_proto_files(proto_dir) {
        Ok(files) => files,
        Err(err) => {
            warn!(dir = %proto_dir.display(), error = %err, "proto directory not readable");
            let mut report = LoadReport::default();
            report.skipped.push(SkippedFile {
                file: proto_dir.display().to_string(),
                error: err.to_string(),
            });
            return SchemaSet {
                report,
                ..SchemaSet::empty()
            };
        }
    };

    if files.is_empty() {
        return SchemaSet::empty();
    }

    let names: Vec<String> = files.iter().map(|f| display_name(proto_dir, f)).collect();

    // Bulk parse: the happy path when every file is well-formed.
    match compile(&files, proto_dir) {
        Ok(pool) => {
            debug!(count = files.len(), "bulk proto compile succeeded");
            let report = LoadReport {
                loaded: names,
                skipped: Vec::new(),
            };
            SchemaSet::from_pool(pool, report)
        }
        Err(bulk_err) => {
            debug!(error = %bulk_err, "bulk proto compile failed, falling back to per-file");
            load_per_file(&files, proto_dir)
        }
    }
}

/// Per-file fallback: compile each top-level file on its own and merge the
/// resulting descriptor sets, so one bad file cannot poison its siblings.
fn load_per_file(files: &[PathBuf], proto_dir: &Path) -> SchemaSet {
    let mut report = LoadReport::default();
    let mut merged: Vec<prost_types::FileDescriptorProto> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for file in files {
        let name = display_name(proto_dir, file);
        match compile_set(std::slice::from_ref(file), proto_dir, file.parent()) {
            Ok(fds) => {
                // protox output is ordered dependencies-first, so appending
                // while deduplicating by file name preserves a valid order.
                for fd in fds.file {
                    let fd_name = fd.name().to_string();
                    if seen.insert(fd_name) {
                        merged.push(fd);
                    }
                }
                report.loaded.push(name);
            }
            Err(err) => {
                warn!(file = %name, error = %err, "skipping unparseable proto file");
                report.skipped.push(SkippedFile {
                    file: name,
                    error: err.to_string(),
                });
            }
        }
    }

    let fds = prost_types::FileDescriptorSet { file: merged };
    match DescriptorPool::from_file_descriptor_set(fds) {
        Ok(pool) => SchemaSet::from_pool(pool, report),
        Err(err) => {
            // Merged descriptors failed to link; serve nothing rather than
            // crash, and surface the error in the report.
            warn!(error = %err, "failed to build descriptor pool from merged files");
            report.skipped.push(SkippedFile {
                file: "<merged descriptor set>".to_string(),
                error: err.to_string(),
            });
            SchemaSet {
                report,
                ..SchemaSet::empty()
            }
        }
    }
}

fn compile(files: &[PathBuf], proto_dir: &Path) -> Result<DescriptorPool> {
    let fds = compile_set(files, proto_dir, None)?;
    DescriptorPool::from_file_descriptor_set(fds)
        .map_err(|e| MockwireError::Proto(format!("failed to build descriptor pool: {e}")))
}

/// Compile proto files with protox. Imports resolve against the proto root,
/// plus (in per-file mode) the importing file's own directory.
fn compile_set(
    files: &[PathBuf],
    proto_dir: &Path,
    extra_include: Option<&Path>,
) -> Result<prost_types::FileDescriptorSet> {
    let mut includes: Vec<&Path> = vec![proto_dir];
    if let Some(extra) = extra_include {
        if extra != proto_dir {
            includes.push(extra);
        }
    }
    protox::compile(files, &includes)
        .map_err(|e| MockwireError::Proto(format!("failed to compile proto files: {e}")))
}

/// Enumerate top-level `.proto` files, sorted by name. Subdirectories hold
/// transitive imports and are not compiled directly.
fn list_proto_files(proto_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(proto_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "proto") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn display_name(proto_dir: &Path, file: &Path) -> String {
    file.strip_prefix(proto_dir)
        .unwrap_or(file)
        .display()
        .to_string()
}

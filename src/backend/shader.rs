// Shader compilation and the on-disk bytecode cache
//
// Sources are single files split into stages with `#type vertex` /
// `#type fragment` markers. Each stage compiles to SPIR-V and is written to the
// cache directory under a name that encodes the cache format version and a hash
// of compiler target + stage + source, so different content never collides.
//
// Expected bytecode already on disk is reused without compiling, even when this
// process has never seen the shader before.

use anyhow::{Context, Result};
use ash::vk;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::SystemTime;
use thiserror::Error;

use super::pipeline_cache::write_atomic;

/// Bump when the bytecode layout or naming changes
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 2] = [ShaderStage::Vertex, ShaderStage::Fragment];

    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
        }
    }

    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }

    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "vertex" => Some(ShaderStage::Vertex),
            "fragment" | "pixel" => Some(ShaderStage::Fragment),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShaderSourceError {
    #[error("unknown shader stage '{marker}' on line {line}")]
    UnknownStage { marker: String, line: usize },
    #[error("'#type {0}' appears more than once")]
    DuplicateStage(&'static str),
    #[error("no '#type {0}' section")]
    MissingStage(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSources {
    pub vertex: String,
    pub fragment: String,
}

impl StageSources {
    pub fn get(&self, stage: ShaderStage) -> &str {
        match stage {
            ShaderStage::Vertex => &self.vertex,
            ShaderStage::Fragment => &self.fragment,
        }
    }
}

/// Split a combined source into its stages.
///
/// Text before the first marker is ignored.
pub fn split_stages(source: &str) -> Result<StageSources, ShaderSourceError> {
    let mut vertex: Option<String> = None;
    let mut fragment: Option<String> = None;
    let mut current: Option<ShaderStage> = None;

    for (number, line) in source.lines().enumerate() {
        if let Some(marker) = line.trim_start().strip_prefix("#type") {
            let marker = marker.trim();
            let stage = ShaderStage::from_marker(marker).ok_or_else(|| ShaderSourceError::UnknownStage {
                marker: marker.to_string(),
                line: number + 1,
            })?;
            let slot = match stage {
                ShaderStage::Vertex => &mut vertex,
                ShaderStage::Fragment => &mut fragment,
            };
            if slot.is_some() {
                return Err(ShaderSourceError::DuplicateStage(stage.name()));
            }
            *slot = Some(String::new());
            current = Some(stage);
            continue;
        }

        let slot = match current {
            Some(ShaderStage::Vertex) => &mut vertex,
            Some(ShaderStage::Fragment) => &mut fragment,
            None => continue,
        };
        if let Some(text) = slot {
            text.push_str(line);
            text.push('\n');
        }
    }

    Ok(StageSources {
        vertex: vertex.ok_or(ShaderSourceError::MissingStage("vertex"))?,
        fragment: fragment.ok_or(ShaderSourceError::MissingStage("fragment"))?,
    })
}

/// Turns one stage of source into SPIR-V words
pub trait ShaderCompiler {
    /// Identifies compiler + output flavour; part of every cache key
    fn target(&self) -> &str;

    fn compile(&self, stage: ShaderStage, source: &str, path: &Path) -> Result<Vec<u32>>;
}

/// GLSL to SPIR-V through naga
#[derive(Debug, Default)]
pub struct NagaCompiler;

impl ShaderCompiler for NagaCompiler {
    fn target(&self) -> &str {
        "naga-glsl450-spv1.0"
    }

    fn compile(&self, stage: ShaderStage, source: &str, path: &Path) -> Result<Vec<u32>> {
        use naga::back::spv;
        use naga::front::glsl::{Frontend, Options};
        use naga::valid::{Capabilities, ValidationFlags, Validator};

        let naga_stage = match stage {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        };

        let mut frontend = Frontend::default();
        let module = frontend
            .parse(&Options::from(naga_stage), source)
            .with_context(|| format!("Failed to parse {} stage of {:?}", stage.name(), path))?;

        let info = Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .with_context(|| format!("Invalid {} stage in {:?}", stage.name(), path))?;

        // Debug names are needed for the per-instance input heuristic
        let mut options = spv::Options::default();
        options.flags |= spv::WriterFlags::DEBUG;

        spv::write_vec(&module, &info, &options, None)
            .with_context(|| format!("Failed to emit SPIR-V for {:?}", path))
    }
}

/// Bytecode file of each stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl SpirvPaths {
    pub fn get(&self, stage: ShaderStage) -> &Path {
        match stage {
            ShaderStage::Vertex => &self.vertex,
            ShaderStage::Fragment => &self.fragment,
        }
    }

    fn exist(&self) -> bool {
        self.vertex.is_file() && self.fragment.is_file()
    }
}

/// What the cache knows about one source file
#[derive(Debug, Clone)]
pub struct ShaderAsset {
    pub source: PathBuf,
    pub spirv: SpirvPaths,
    /// Source write time when the bytecode was produced or adopted
    pub source_modified: SystemTime,
}

pub struct ShaderCache<C: ShaderCompiler = NagaCompiler> {
    compiler: C,
    cache_dir: PathBuf,
    assets: HashMap<PathBuf, ShaderAsset>,
}

impl ShaderCache<NagaCompiler> {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_compiler(cache_dir, NagaCompiler)
    }
}

impl<C: ShaderCompiler> ShaderCache<C> {
    pub fn with_compiler(cache_dir: impl Into<PathBuf>, compiler: C) -> Self {
        Self {
            compiler,
            cache_dir: cache_dir.into(),
            assets: HashMap::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn asset(&self, source: &Path) -> Option<&ShaderAsset> {
        self.assets.get(source)
    }

    /// Bytecode paths for `source`, compiling only when needed
    pub fn get_or_compile_spirv_paths(&mut self, source: &Path) -> Result<SpirvPaths> {
        if let Some(asset) = self.assets.get(source) {
            if !is_stale(asset) {
                log::debug!("Shader cache hit: {:?}", source);
                return Ok(asset.spirv.clone());
            }
            log::info!("Shader {:?} changed, recompiling", source);
        }

        let result = self.compile_or_adopt(source);
        if let Err(e) = &result {
            log::error!("Shader {:?} unavailable: {:#}", source, e);
        }
        result
    }

    fn compile_or_adopt(&mut self, source: &Path) -> Result<SpirvPaths> {
        let text = fs::read_to_string(source).with_context(|| format!("Failed to read shader {:?}", source))?;
        let source_modified = modified(source)?;
        let stages = split_stages(&text).with_context(|| format!("Bad stage markers in {:?}", source))?;
        let spirv = self.spirv_paths(source, &stages);

        // Bytecode left by an earlier run is adopted only if it is still fresh
        if !self.assets.contains_key(source) {
            let on_disk = ShaderAsset {
                source: source.to_path_buf(),
                spirv: spirv.clone(),
                source_modified,
            };
            if !is_stale(&on_disk) {
                log::info!("Reusing cached bytecode for {:?}", source);
                self.assets.insert(source.to_path_buf(), on_disk);
                return Ok(spirv);
            }
        }

        // Both stages must compile before anything is written
        let mut compiled = Vec::with_capacity(ShaderStage::ALL.len());
        for stage in ShaderStage::ALL {
            let words = self.compiler.compile(stage, stages.get(stage), source)?;
            compiled.push((stage, words));
        }

        for (stage, words) in &compiled {
            write_atomic(spirv.get(*stage), bytemuck::cast_slice(words))?;
        }
        log::info!("Compiled shader {:?} -> {:?}", source, self.cache_dir);

        self.remember(source, &spirv, source_modified);
        Ok(spirv)
    }

    fn remember(&mut self, source: &Path, spirv: &SpirvPaths, source_modified: SystemTime) {
        self.assets.insert(
            source.to_path_buf(),
            ShaderAsset {
                source: source.to_path_buf(),
                spirv: spirv.clone(),
                source_modified,
            },
        );
    }

    fn spirv_paths(&self, source: &Path, stages: &StageSources) -> SpirvPaths {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shader".to_string());

        let path_for = |stage: ShaderStage| {
            let hash = content_hash(self.compiler.target(), stage, stages.get(stage));
            self.cache_dir.join(format!(
                "{}.{}.v{}.{}.spv",
                stem,
                stage.name(),
                CACHE_FORMAT_VERSION,
                hash
            ))
        };

        SpirvPaths {
            vertex: path_for(ShaderStage::Vertex),
            fragment: path_for(ShaderStage::Fragment),
        }
    }
}

/// First 16 hex digits of SHA-256 over target, stage and source
fn content_hash(target: &str, stage: ShaderStage, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update([0u8]);
    hasher.update(stage.name().as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    hasher.finalize()[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat {:?}", path))
}

/// Source rewritten since it was recorded, source or any sibling newer than
/// the bytecode, or bytecode missing.
///
/// Siblings stand in for includes, which are not tracked individually.
fn is_stale(asset: &ShaderAsset) -> bool {
    match modified(&asset.source) {
        Ok(time) if time == asset.source_modified => {}
        _ => return true,
    }

    let oldest_bytecode = match (modified(&asset.spirv.vertex), modified(&asset.spirv.fragment)) {
        (Ok(a), Ok(b)) => a.min(b),
        _ => return true,
    };

    let Some(dir) = asset.source.parent() else {
        return true;
    };
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };

    let Ok(entries) = fs::read_dir(dir) else {
        return true;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .filter_map(|meta| meta.modified().ok())
        .any(|time| time > oldest_bytecode)
}

/// Load bytecode and wrap it in a shader module
pub fn create_shader_module(device: &ash::Device, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read bytecode {:?}", path))?;
    let words = super::reflect::spirv_words(&bytes).with_context(|| format!("{:?}", path))?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .create_shader_module(&create_info, None)
            .with_context(|| format!("Failed to create shader module from {:?}", path))
    }
}

/// Reports edited shader sources so pipelines can be rebuilt
pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    receiver: mpsc::Receiver<Event>,
}

impl ShaderWatcher {
    pub fn new(dir: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .context("Failed to create shader watcher")?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;
        log::info!("Watching {:?} for shader changes", dir);

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
        })
    }

    /// Shader sources modified or created since the last poll, deduplicated
    pub fn poll_changed(&self) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }
            for path in event.paths {
                if is_shader_source(&path) && !changed.contains(&path) {
                    changed.push(path);
                }
            }
        }
        changed
    }
}

fn is_shader_source(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("glsl"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::reflect::test_spirv::{input, vertex_module, InputType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const TRIANGLE: &str = "\
// shared header, ignored
#type vertex
#version 450
layout(location = 0) in vec3 a_position;
void main() { gl_Position = vec4(a_position, 1.0); }
#type fragment
#version 450
layout(location = 0) out vec4 o_color;
void main() { o_color = vec4(1.0); }
";

    /// Emits a fixed vertex module and counts invocations per stage
    #[derive(Clone, Default)]
    struct CountingCompiler {
        calls: Arc<AtomicUsize>,
        fail_fragment: bool,
    }

    impl CountingCompiler {
        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ShaderCompiler for CountingCompiler {
        fn target(&self) -> &str {
            "test"
        }

        fn compile(&self, stage: ShaderStage, _source: &str, _path: &Path) -> Result<Vec<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if stage == ShaderStage::Fragment && self.fail_fragment {
                anyhow::bail!("syntax error");
            }
            Ok(vertex_module(&[input("a_position", 0, InputType::Float(3))]))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        source: PathBuf,
        sibling: PathBuf,
        cache_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let shaders = dir.path().join("shaders");
        fs::create_dir_all(&shaders).unwrap();
        let source = shaders.join("triangle.glsl");
        let sibling = shaders.join("common.glsl");
        fs::write(&source, TRIANGLE).unwrap();
        fs::write(&sibling, "// include\n").unwrap();

        let past = SystemTime::now() - Duration::from_secs(100);
        set_mtime(&source, past);
        set_mtime(&sibling, past);

        Fixture {
            cache_dir: dir.path().join("cache"),
            source,
            sibling,
            _dir: dir,
        }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn mtime(path: &Path) -> SystemTime {
        fs::metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn splits_stage_sections() {
        let stages = split_stages(TRIANGLE).unwrap();
        assert!(stages.vertex.starts_with("#version 450\nlayout(location = 0) in vec3"));
        assert!(stages.fragment.contains("o_color"));
        assert!(!stages.vertex.contains("shared header"));
    }

    #[test]
    fn pixel_is_an_alias_for_fragment() {
        let stages = split_stages("#type vertex\nv\n#type pixel\np\n").unwrap();
        assert_eq!(stages.fragment, "p\n");
    }

    #[test]
    fn bad_markers_are_errors() {
        assert_eq!(
            split_stages("#type vertex\nv\n"),
            Err(ShaderSourceError::MissingStage("fragment"))
        );
        assert_eq!(
            split_stages("#type vertex\n#type geometry\n"),
            Err(ShaderSourceError::UnknownStage {
                marker: "geometry".into(),
                line: 2
            })
        );
        assert!(matches!(
            split_stages("#type vertex\n#type fragment\n#type vertex\n"),
            Err(ShaderSourceError::DuplicateStage(_))
        ));
    }

    #[test]
    fn repeated_requests_compile_once_and_write_nothing() {
        let f = fixture();
        let compiler = CountingCompiler::default();
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, compiler.clone());

        let first = cache.get_or_compile_spirv_paths(&f.source).unwrap();
        assert_eq!(compiler.count(), 2);
        let written = (mtime(&first.vertex), mtime(&first.fragment));

        let second = cache.get_or_compile_spirv_paths(&f.source).unwrap();
        assert_eq!(first, second);
        assert_eq!(compiler.count(), 2);
        assert_eq!((mtime(&second.vertex), mtime(&second.fragment)), written);
    }

    #[test]
    fn cache_file_names_encode_version_and_hash() {
        let f = fixture();
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, CountingCompiler::default());
        let paths = cache.get_or_compile_spirv_paths(&f.source).unwrap();

        let name = paths.vertex.file_name().unwrap().to_string_lossy().into_owned();
        let parts: Vec<_> = name.split('.').collect();
        assert_eq!(parts[..3], ["triangle", "vert", "v1"]);
        assert_eq!(parts[3].len(), 16);
        assert_eq!(parts[4], "spv");
        assert_ne!(paths.vertex, paths.fragment);
    }

    #[test]
    fn touching_source_or_sibling_recompiles() {
        let f = fixture();
        let compiler = CountingCompiler::default();
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, compiler.clone());

        let paths = cache.get_or_compile_spirv_paths(&f.source).unwrap();
        let aged = SystemTime::now() - Duration::from_secs(50);
        set_mtime(&paths.vertex, aged);
        set_mtime(&paths.fragment, aged);

        cache.get_or_compile_spirv_paths(&f.source).unwrap();
        assert_eq!(compiler.count(), 2);

        set_mtime(&f.sibling, SystemTime::now() - Duration::from_secs(10));
        cache.get_or_compile_spirv_paths(&f.source).unwrap();
        assert_eq!(compiler.count(), 4);
        assert!(mtime(&paths.vertex) > aged);

        set_mtime(&paths.vertex, aged);
        set_mtime(&paths.fragment, aged);
        set_mtime(&f.sibling, SystemTime::now() - Duration::from_secs(100));
        set_mtime(&f.source, SystemTime::now() - Duration::from_secs(10));
        cache.get_or_compile_spirv_paths(&f.source).unwrap();
        assert_eq!(compiler.count(), 6);
    }

    #[test]
    fn deleted_bytecode_is_rebuilt() {
        let f = fixture();
        let compiler = CountingCompiler::default();
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, compiler.clone());

        let paths = cache.get_or_compile_spirv_paths(&f.source).unwrap();
        fs::remove_file(&paths.fragment).unwrap();
        cache.get_or_compile_spirv_paths(&f.source).unwrap();
        assert_eq!(compiler.count(), 4);
        assert!(paths.fragment.is_file());
    }

    #[test]
    fn fresh_cache_reuses_bytecode_on_disk() {
        let f = fixture();
        let first_run = CountingCompiler::default();
        let expected = ShaderCache::with_compiler(&f.cache_dir, first_run.clone())
            .get_or_compile_spirv_paths(&f.source)
            .unwrap();

        let second_run = CountingCompiler::default();
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, second_run.clone());
        let paths = cache.get_or_compile_spirv_paths(&f.source).unwrap();

        assert_eq!(paths, expected);
        assert_eq!(second_run.count(), 0);
        assert!(cache.asset(&f.source).is_some());
    }

    #[test]
    fn fresh_cache_recompiles_outdated_bytecode_once() {
        let f = fixture();
        let paths = ShaderCache::with_compiler(&f.cache_dir, CountingCompiler::default())
            .get_or_compile_spirv_paths(&f.source)
            .unwrap();
        set_mtime(&paths.vertex, SystemTime::now() - Duration::from_secs(50));
        set_mtime(&paths.fragment, SystemTime::now() - Duration::from_secs(50));
        set_mtime(&f.sibling, SystemTime::now() - Duration::from_secs(10));

        let restarted = CountingCompiler::default();
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, restarted.clone());
        cache.get_or_compile_spirv_paths(&f.source).unwrap();
        assert_eq!(restarted.count(), 2);
        let written = (mtime(&paths.vertex), mtime(&paths.fragment));

        cache.get_or_compile_spirv_paths(&f.source).unwrap();
        assert_eq!(restarted.count(), 2);
        assert_eq!((mtime(&paths.vertex), mtime(&paths.fragment)), written);
    }

    #[test]
    fn edited_content_gets_new_files() {
        let f = fixture();
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, CountingCompiler::default());
        let before = cache.get_or_compile_spirv_paths(&f.source).unwrap();
        let aged = SystemTime::now() - Duration::from_secs(50);
        set_mtime(&before.vertex, aged);
        set_mtime(&before.fragment, aged);

        fs::write(&f.source, TRIANGLE.replace("vec4(1.0)", "vec4(0.5)")).unwrap();
        let after = cache.get_or_compile_spirv_paths(&f.source).unwrap();

        assert_eq!(before.vertex, after.vertex);
        assert_ne!(before.fragment, after.fragment);
    }

    #[test]
    fn failed_compile_writes_nothing() {
        let f = fixture();
        let compiler = CountingCompiler {
            fail_fragment: true,
            ..Default::default()
        };
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, compiler);

        assert!(cache.get_or_compile_spirv_paths(&f.source).is_err());
        assert!(cache.asset(&f.source).is_none());
        let files = fs::read_dir(&f.cache_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(files, 0);
    }

    #[test]
    fn missing_source_is_an_error() {
        let f = fixture();
        let mut cache = ShaderCache::with_compiler(&f.cache_dir, CountingCompiler::default());
        assert!(cache
            .get_or_compile_spirv_paths(&f.source.with_file_name("nope.glsl"))
            .is_err());
    }

    #[test]
    fn naga_compiles_glsl_with_named_inputs() {
        let stages = split_stages(TRIANGLE).unwrap();
        let words = NagaCompiler
            .compile(ShaderStage::Vertex, &stages.vertex, Path::new("triangle.glsl"))
            .unwrap();

        let bindings = crate::backend::reflect::reflect_vertex_input_bindings(&words).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].attributes[0].name, "a_position");
        assert_eq!(bindings[0].stride, 12);
    }
}

//! Kernel Packer CLI
//!
//! Usage:
//!   kernel_packer build --source add_custom.cpp --symbol add_custom --channel vector
//!   kernel_packer pack --descriptor add.json --object add.o --output add.bin
//!   kernel_packer embed --container add.bin --kernel-id AddKernel --arch ascend910b
//!   kernel_packer inspect add.bin
//!   kernel_packer matrix --op-list configs/op_list.yaml
//!   kernel_packer package-dir --binary-dir build/binary --kind ascendc

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use kernel_packer::config::{
    load_enabled_targets, BUILD_CONFIG_FILE_ENV, CACHE_DIR_ENV, CODE_ROOT_ENV, DEFAULT_MUTABLE_MARKER,
    KERNEL_PATH_ENV, TACTIC_TABLE_PATH,
};
use kernel_packer::embed::write_source;
use kernel_packer::pipeline::{pack_files, targets_from_matrix};
use kernel_packer::prebuilt::{package_tactic_table, package_tactic_tree};
use kernel_packer::validation::validate_container;
use kernel_packer::{
    render, resolve, unpack, Architecture, BuildConfig, BuildMatrix, BuildTarget, Channel, DeclaredMatrix,
    EmbedOptions, KernelPackError, KernelSource, Pipeline, ProcessToolchain, Result, ReuseSet, TacticTable,
};

#[derive(Parser)]
#[command(name = "kernel_packer")]
#[command(author, version, about = "Build, pack and embed device kernels", long_about = None)]
struct Cli {
    /// More output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile, link, pack and embed one kernel source
    Build(BuildArgs),

    /// Pack a linked object and its descriptor into a container
    Pack(PackArgs),

    /// Generate registration source for a container
    Embed(EmbedArgs),

    /// Print a container's header and tables as JSON
    Inspect(InspectArgs),

    /// Resolve the build matrix and print CMake options
    Matrix(MatrixArgs),

    /// Pack and embed prebuilt kernels for every enabled architecture
    PackageDir(PackageDirArgs),
}

#[derive(Args)]
struct MatrixInputs {
    /// Operator map (op_list.yaml)
    #[arg(long)]
    op_list: Option<PathBuf>,

    /// Enabled-target config file
    #[arg(long, env = BUILD_CONFIG_FILE_ENV)]
    build_config: Option<PathBuf>,

    /// Kernels provided by an alternate source: [{"kernel", "architecture"}]
    #[arg(long)]
    reuse: Option<PathBuf>,

    /// Tactic table whose kernels are prebuilt rather than compiled
    #[arg(long)]
    tactic_table: Option<PathBuf>,
}

#[derive(Args)]
struct BuildArgs {
    /// Device kernel source
    #[arg(long)]
    source: PathBuf,

    /// Exported kernel entry symbol
    #[arg(long)]
    symbol: String,

    /// Registry identifier (defaults to the symbol)
    #[arg(long)]
    kernel_id: Option<String>,

    /// vector, cube or mix
    #[arg(long, default_value = "vector")]
    channel: String,

    /// Build for these architectures instead of consulting the matrix
    #[arg(long = "arch")]
    architectures: Vec<String>,

    #[command(flatten)]
    matrix: MatrixInputs,

    /// Source tree root holding the bundled toolchain
    #[arg(long, env = CODE_ROOT_ENV, default_value = ".")]
    code_root: PathBuf,

    #[arg(long)]
    compiler: Option<PathBuf>,

    #[arg(long)]
    linker: Option<PathBuf>,

    #[arg(short, long, default_value = "build")]
    output: PathBuf,

    /// Directory for generated .cpp files
    #[arg(long, env = CACHE_DIR_ENV)]
    generated_dir: Option<PathBuf>,

    /// Parallel tool jobs (0 = one per CPU)
    #[arg(short, long, default_value_t = 0)]
    jobs: usize,

    #[arg(long)]
    debug: bool,

    #[arg(long)]
    sanitizer: bool,

    /// Silence deprecation and array-bounds warnings
    #[arg(long)]
    no_warnings: bool,

    /// Extra attempts for a failed compile or link
    #[arg(long, default_value_t = 0)]
    retries: u32,

    #[arg(long, default_value = DEFAULT_MUTABLE_MARKER)]
    mutable_marker: String,
}

#[derive(Args)]
struct PackArgs {
    #[arg(long)]
    descriptor: PathBuf,

    #[arg(long)]
    object: PathBuf,

    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct EmbedArgs {
    #[arg(long)]
    container: PathBuf,

    #[arg(long)]
    kernel_id: String,

    #[arg(long = "arch")]
    architecture: String,

    /// Defaults to <kernel_id>.cpp next to the container
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_MUTABLE_MARKER)]
    mutable_marker: String,
}

#[derive(Args)]
struct InspectArgs {
    container: PathBuf,
}

#[derive(Args)]
struct MatrixArgs {
    #[command(flatten)]
    inputs: MatrixInputs,

    /// Write options here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PrebuiltKind {
    /// `<binary_dir>/op_kernels/<arch>/<op>/<tactic>/` trees
    Ascendc,
    /// Tactic table entries under the prebuilt kernel root
    Tbe,
    All,
}

#[derive(Args)]
struct PackageDirArgs {
    /// Build output holding `op_kernels/`
    #[arg(long)]
    binary_dir: PathBuf,

    #[arg(long, value_enum, default_value = "all")]
    kind: PrebuiltKind,

    /// Enabled-target config file
    #[arg(long, env = BUILD_CONFIG_FILE_ENV)]
    build_config: PathBuf,

    /// Generated sources go under <cache_dir>/obj/<arch>/<op>/
    #[arg(long, env = CACHE_DIR_ENV)]
    cache_dir: PathBuf,

    #[arg(long, env = CODE_ROOT_ENV, default_value = ".")]
    code_root: PathBuf,

    /// Defaults to <code_root>/configs/tbe_tactic_json.ini
    #[arg(long)]
    tactic_table: Option<PathBuf>,

    /// Root of prebuilt per-architecture kernels named by the tactic table
    #[arg(long, env = KERNEL_PATH_ENV)]
    kernel_path: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_MUTABLE_MARKER)]
    mutable_marker: String,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Pack(args) => run_pack(args),
        Commands::Embed(args) => run_embed(args),
        Commands::Inspect(args) => run_inspect(args),
        Commands::Matrix(args) => run_matrix(args),
        Commands::PackageDir(args) => run_package_dir(args),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn load_matrix(inputs: &MatrixInputs) -> Result<Option<BuildMatrix>> {
    let Some(op_list) = &inputs.op_list else {
        return Ok(None);
    };
    let build_config = inputs.build_config.as_deref().ok_or_else(|| KernelPackError::InvalidConfig {
        path: op_list.clone(),
        reason: format!("resolving the matrix needs --build-config or {}", BUILD_CONFIG_FILE_ENV),
    })?;

    let declared = DeclaredMatrix::load(op_list)?;
    let enabled = load_enabled_targets(build_config)?;
    let mut reuse = match &inputs.reuse {
        Some(path) => ReuseSet::load(path)?,
        None => ReuseSet::new(),
    };
    if let Some(path) = &inputs.tactic_table {
        reuse.extend(TacticTable::load(path)?.reuse_set(&enabled));
    }
    resolve(&declared, &enabled, &reuse).map(Some)
}

fn build_targets(args: &BuildArgs, kernel_id: &str, channel: Channel) -> Result<Vec<BuildTarget>> {
    if !args.architectures.is_empty() {
        return args
            .architectures
            .iter()
            .map(|name| BuildTarget::new(name.parse()?, channel))
            .collect();
    }

    if let Some(matrix) = load_matrix(&args.matrix)? {
        return targets_from_matrix(&matrix, kernel_id, channel);
    }

    let enabled: BTreeSet<Architecture> = match &args.matrix.build_config {
        Some(path) => load_enabled_targets(path)?,
        None => {
            return Err(KernelPackError::InvalidConfig {
                path: args.source.clone(),
                reason: format!("no --arch, --op-list or {} given", BUILD_CONFIG_FILE_ENV),
            })
        }
    };
    enabled.into_iter().map(|arch| BuildTarget::new(arch, channel)).collect()
}

fn run_build(args: BuildArgs) -> Result<()> {
    let kernel_id = args.kernel_id.clone().unwrap_or_else(|| args.symbol.clone());
    let channel: Channel = args.channel.parse()?;
    let targets = build_targets(&args, &kernel_id, channel)?;
    if targets.is_empty() {
        warn!("Nothing to build for {}", kernel_id);
        return Ok(());
    }

    let config = BuildConfig {
        code_root: args.code_root,
        compiler: args.compiler,
        linker: args.linker,
        output_dir: args.output,
        jobs: args.jobs,
        debug: args.debug,
        sanitizer: args.sanitizer,
        suppress_warnings: args.no_warnings,
        retries: args.retries,
        mutable_marker: args.mutable_marker,
    };
    let toolchain = ProcessToolchain::from_config(&config);

    let abort = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&abort);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping after running jobs...");
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl+C handler: {}", e);
    }

    let mut pipeline = Pipeline::new(&config, &toolchain).with_abort_flag(abort);
    if let Some(dir) = args.generated_dir {
        pipeline = pipeline.with_generated_dir(dir);
    }

    let source = KernelSource::new(args.source, args.symbol, kernel_id);
    let output = pipeline.run(&source, &targets)?;

    for artifact in &output.artifacts {
        info!(
            "{} -> {}",
            artifact.container.display(),
            artifact.generated.display()
        );
    }
    info!(
        "Built {} artifact(s): {} compile(s), {} link(s), {} retr(ies) in {} ms",
        output.artifacts.len(),
        output.stats.compiles,
        output.stats.links,
        output.stats.retries,
        output.stats.total_time_ms
    );
    Ok(())
}

fn run_pack(args: PackArgs) -> Result<()> {
    let packed = pack_files(&args.descriptor, &args.object)?;
    write_file(&args.output, &packed)?;
    info!("Wrote {} ({} bytes)", args.output.display(), packed.len());
    Ok(())
}

fn read_container(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|e| KernelPackError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    validate_container(&bytes).map_err(|reason| {
        KernelPackError::InconsistentContainer(format!("{}: {}", path.display(), reason))
    })?;
    Ok(bytes)
}

fn run_embed(args: EmbedArgs) -> Result<()> {
    let bytes = read_container(&args.container)?;
    let architecture: Architecture = args.architecture.parse()?;
    let options = EmbedOptions {
        mutable_marker: args.mutable_marker,
    };
    let source = render(&bytes, &args.kernel_id, architecture, &options)?;

    let output = args.output.unwrap_or_else(|| {
        args.container
            .with_file_name(format!("{}.cpp", args.kernel_id))
    });
    write_source(&output, &source)
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let bytes = read_container(&args.container)?;
    let artifact = unpack(&bytes)?;
    let base = &artifact.header.base;

    let mut report = serde_json::json!({
        "version": base.version,
        "magic": format!("0x{:08X}", base.magic),
        "opParaSize": base.op_para_size,
        "coreType": base.core_type,
        "kernelNum": base.kernel_num,
        "compileInfoOffset": base.compile_info_offset,
        "binaryOffset": base.binary_offset,
        "crc": artifact.header.crc,
        "kernelList": &artifact.kernel_list,
        "compileInfo": artifact.compile_info_trimmed(),
        "binarySize": artifact.object.len(),
    });
    if let Some(ext) = artifact.header.extension {
        report["intercoreSync"] = ext.intercore_sync.into();
        report["taskRation"] = ext.task_ration.into();
    }

    let text = serde_json::to_string_pretty(&report).map_err(|e| KernelPackError::MalformedDescriptor {
        path: args.container.clone(),
        source: e,
    })?;
    println!("{}", text);
    Ok(())
}

fn run_matrix(args: MatrixArgs) -> Result<()> {
    if args.inputs.op_list.is_none() {
        return Err(KernelPackError::InvalidConfig {
            path: PathBuf::from("op_list.yaml"),
            reason: "--op-list is required".to_string(),
        });
    }
    let Some(matrix) = load_matrix(&args.inputs)? else {
        return Ok(());
    };
    let options = matrix.to_cmake_options();

    match args.output {
        Some(path) => {
            write_file(&path, options.as_bytes())?;
            info!("Wrote {} option(s) to {}", options.lines().count(), path.display());
        }
        None => print!("{}", options),
    }
    Ok(())
}

fn run_package_dir(args: PackageDirArgs) -> Result<()> {
    let enabled = load_enabled_targets(&args.build_config)?;
    let options = EmbedOptions {
        mutable_marker: args.mutable_marker,
    };
    let mut total = 0;

    if matches!(args.kind, PrebuiltKind::Tbe | PrebuiltKind::All) {
        let table_path = args
            .tactic_table
            .unwrap_or_else(|| args.code_root.join(TACTIC_TABLE_PATH));
        let kernel_path = args.kernel_path.ok_or_else(|| KernelPackError::InvalidConfig {
            path: table_path.clone(),
            reason: format!("tactic table packaging needs --kernel-path or {}", KERNEL_PATH_ENV),
        })?;
        info!("Prebuilt kernel root: {}", kernel_path.display());
        let table = TacticTable::load(&table_path)?;
        total += package_tactic_table(&table, &kernel_path, &enabled, &args.cache_dir, &options)?.len();
    }

    if matches!(args.kind, PrebuiltKind::Ascendc | PrebuiltKind::All) {
        total += package_tactic_tree(&args.binary_dir, &enabled, &args.cache_dir, &options)?.len();
    }

    info!("Generated {} source(s) under {}", total, args.cache_dir.join("obj").display());
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| KernelPackError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::write(path, bytes).map_err(|e| KernelPackError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

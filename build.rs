pub fn main() {
    emit_version_info();
}

/// Emit git version information using vergen
///
/// The client identifier sent with every spot report embeds
/// `VERGEN_GIT_DESCRIBE` when it is available (e.g. "v0.3.1-2-ge930185").
/// Outside a git checkout vergen emits placeholder values and a warning,
/// and the crate falls back to `CARGO_PKG_VERSION` at compile time.
fn emit_version_info() {
    use vergen_git2::{BuildBuilder, CargoBuilder, Emitter, Git2Builder};

    let build = BuildBuilder::default()
        .build_timestamp(true)
        .build()
        .expect("Failed to configure build info");

    let cargo = CargoBuilder::default()
        .target_triple(true)
        .build()
        .expect("Failed to configure cargo info");

    let git2 = Git2Builder::default()
        .describe(true, true, None)
        .sha(true)
        .build()
        .expect("Failed to configure git info");

    Emitter::default()
        .add_instructions(&build)
        .expect("Failed to add build instructions")
        .add_instructions(&cargo)
        .expect("Failed to add cargo instructions")
        .add_instructions(&git2)
        .expect("Failed to add git instructions")
        .emit()
        .expect("Failed to emit version info");
}

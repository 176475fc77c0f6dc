//! ---
//! lmp_section: "01-core-functionality"
//! lmp_subsection: "binary"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Build script emitting the metadata shown by `lmp-chaosd -V`."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use vergen::EmitBuilder;

// Emits only the variables read by `version.rs`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    EmitBuilder::builder()
        .build_timestamp()
        .cargo_target_triple()
        .cargo_opt_level()
        .emit()?;
    Ok(())
}

//! Build script for regenerating Rust code from the protobuf definition.
//!
//! Generated sources are checked in under `src/generated/`, so a normal
//! build never needs `protoc`. Enable the `codegen` feature to regenerate
//! after editing `proto/provider.proto`.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto = PathBuf::from("proto/provider.proto");
    println!("cargo:rerun-if-changed={}", proto.display());

    if std::env::var_os("CARGO_FEATURE_CODEGEN").is_none() {
        return Ok(());
    }

    let out_dir = PathBuf::from("src/generated");
    std::fs::create_dir_all(&out_dir)?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&out_dir)
        .compile(&[proto], &[PathBuf::from("proto")])?;

    Ok(())
}

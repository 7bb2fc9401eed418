use std::io;
use std::path::Path;

const PROTO_DIR: &str = "./protos/";
const PROTOS: &[&str] = &["./protos/raft.proto"];
const GENERATED_DIR: &str = "./generated/";

fn main() -> io::Result<()> {
    for proto in PROTOS {
        println!("cargo:rerun-if-changed={}", proto);
    }

    generate_grpc_bindings(GENERATED_DIR)
}

/// Generates the raft wire types and the tonic client/server for them. `lib.rs` includes the
/// output from `generated/raft.rs`.
fn generate_grpc_bindings<P: AsRef<Path>>(out_dir: P) -> io::Result<()> {
    std::fs::create_dir_all(out_dir.as_ref())?;
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .out_dir(out_dir.as_ref())
        .compile(PROTOS, &[PROTO_DIR])
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use main proto directory (../../proto relative to client/rust)
    // so the daemon and its clients share one definition
    let proto_root = "../../proto";

    println!("cargo:rerun-if-changed={}", proto_root);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[format!("{}/eos_updater/updater.proto", proto_root)],
            &[proto_root],
        )?;

    Ok(())
}

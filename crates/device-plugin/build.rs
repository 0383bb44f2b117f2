fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Server for the plugin itself, client for registration; the opposite
    // halves are used by the tests to stand in for the kubelet.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/api.proto");
    Ok(())
}

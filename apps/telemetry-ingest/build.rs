fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc_path = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc_path);

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(
            &["../../proto/telemetry.proto", "../../proto/ingest_status.proto"],
            &["../../proto"],
        )?;
    println!("cargo:rerun-if-changed=../../proto/telemetry.proto");
    println!("cargo:rerun-if-changed=../../proto/ingest_status.proto");
    Ok(())
}

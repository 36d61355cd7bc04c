fn main() -> Result<(), Box<dyn std::error::Error>> {
    // fall back to the bundled protoc
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    println!("cargo:rerun-if-changed=proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/deviceplugin.proto", "proto/pluginregistration.proto"],
            &["proto"],
        )?;
    Ok(())
}

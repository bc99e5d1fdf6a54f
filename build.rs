//
fn main() {
    println!("cargo:rerun-if-changed=proto/dbagent.proto");
    // Fall back to the bundled protoc when the host has none.
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }
    std::fs::create_dir_all("src/pb").unwrap();
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/pb") // generate into a real, tracked path
        .compile_protos(&["proto/dbagent.proto"], &["proto"])
        .unwrap();
}

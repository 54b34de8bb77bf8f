use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("tarmak-bridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: tarmak-bridge");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "frame: header={} fragment={} max_payload={}",
        tarmak_mux::HEADER_SIZE,
        tarmak_mux::FRAGMENT_SIZE,
        tarmak_mux::MAX_PAYLOAD
    );
    println!("procedures: {}", tarmak_rpc::PROCEDURES.len());

    Ok(SUCCESS)
}

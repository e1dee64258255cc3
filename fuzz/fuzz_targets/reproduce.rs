use log::info;
use carousel_cache::protocol::{Command, WorkerResult, decode_frame};

fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: reproduce <artifact-file>");
        std::process::exit(1);
    });

    let data = std::fs::read(&path).unwrap_or_else(|e| {
        eprintln!("Failed to read {path}: {e}");
        std::process::exit(1);
    });
    info!("reproduce: {} bytes from {path}", data.len());

    match decode_frame::<Command>(&data) {
        Ok(Some((cmd, used))) => println!("command: {cmd:?} ({used} bytes)"),
        Ok(None) => println!("command: incomplete frame"),
        Err(e) => println!("command: {e}"),
    }
    match decode_frame::<WorkerResult>(&data) {
        Ok(Some((res, used))) => println!("result: {res:?} ({used} bytes)"),
        Ok(None) => println!("result: incomplete frame"),
        Err(e) => println!("result: {e}"),
    }
}

//! Runs a model directory on an image stored as a serialized float tensor.
//!
//! ```text
//! cargo run --example classify -- <model dir> <input.t7>
//! ```
//!
//! The input holds `[3, H, W]` or `[N, 3, H, W]` raw pixel values; every
//! output value is printed as `(plane,y,x): value`.

use std::env;
use std::process;

use env_logger::TimestampPrecision;
use log::info;

use thnets::api::{ThNetwork, last_error};
use thnets::io::{self, ReaderOptions};

fn main() {
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {} <model dir> <input.t7>", args[0]);
        process::exit(2);
    }

    let mut net = match ThNetwork::load_network(&args[1]) {
        Ok(net) => net,
        Err(e) => {
            eprintln!("error {} loading {}: {e}", last_error(), args[1]);
            process::exit(1);
        }
    };
    net.make_spatial().expect("network does not fit the default crop");

    let input = io::load_file(&args[2], ReaderOptions::default()).expect("failed to read input");
    let tensor = input
        .as_tensor()
        .expect("input file does not hold a tensor")
        .to_float_tensor()
        .expect("input tensor is malformed");
    let (batch, height, width) = match *tensor.sizes() {
        [_, h, w] => (1, h, w),
        [n, _, h, w] => (n, h, w),
        _ => panic!("expected a 3-D or 4-D input, got {:?}", tensor.sizes()),
    };
    info!("input {:?}", tensor.sizes());

    let out = net.process_float(&tensor.to_vec(), batch, width, height);
    let values = out.to_vec();
    let plane = out.width * out.height;
    for (i, v) in values.iter().enumerate() {
        let (p, y, x) = (i / plane, (i % plane) / out.width, i % out.width);
        println!("({p},{y},{x}): {v}");
    }
}

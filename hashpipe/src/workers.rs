//! Built-in worker descriptors: `fluff_thread`, the archetype compute
//! stage that attaches an input and output ring, copies the per-block
//! header, and runs the fluff transform over the payload; and
//! `null_output_thread`, a sink that drains and frees blocks without
//! looking at their contents. Registered once at process start by
//! [`register_builtin`] so the supervisor can resolve them by name and
//! `registry::list` reflects what's actually runnable.

use std::sync::atomic::Ordering;

use crate::databuf::RingDatabuf;
use crate::error::{HpError, Result};
use crate::registry::{self, ThreadArgs, ThreadDesc};
use crate::transform::fluff::{copy_header, Dims};

const FLUFF_SKEY: &str = "FLUFST";
const NULL_OUTPUT_SKEY: &str = "NULLST";

const RING_HEADER_SIZE: usize = 128;
const BLOCK_HEADER_SIZE: usize = 8;
const FLUFF_DIMS: Dims = Dims {
    n_m: 1,
    n_f: 8,
    n_t: 8,
    n_c: 8,
};
const FLUFF_IN_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + FLUFF_DIMS.input_len();
const FLUFF_OUT_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + FLUFF_DIMS.output_len();
const DEFAULT_N_BLOCK: usize = 8;

fn fluff_ibuf_create(instance_id: i32, databuf_id: i32) -> Result<()> {
    RingDatabuf::create(
        instance_id,
        databuf_id,
        "FLUFF_IN",
        RING_HEADER_SIZE,
        FLUFF_IN_BLOCK_SIZE,
        DEFAULT_N_BLOCK,
    )?;
    Ok(())
}

fn fluff_obuf_create(instance_id: i32, databuf_id: i32) -> Result<()> {
    RingDatabuf::create(
        instance_id,
        databuf_id,
        "FLUFF_OUT",
        RING_HEADER_SIZE,
        FLUFF_OUT_BLOCK_SIZE,
        DEFAULT_N_BLOCK,
    )?;
    Ok(())
}

fn null_output_ibuf_create(instance_id: i32, databuf_id: i32) -> Result<()> {
    RingDatabuf::create(
        instance_id,
        databuf_id,
        "FLUFF_OUT",
        RING_HEADER_SIZE,
        FLUFF_OUT_BLOCK_SIZE,
        DEFAULT_N_BLOCK,
    )?;
    Ok(())
}

fn fluff_run(args: &ThreadArgs, input: Option<&RingDatabuf>, output: Option<&RingDatabuf>) -> Result<()> {
    let input = input.ok_or_else(|| HpError::fatal("fluff_thread requires an input databuf"))?;
    let output = output.ok_or_else(|| HpError::fatal("fluff_thread requires an output databuf"))?;

    let in_block = (args.cursor.load(Ordering::Relaxed) as usize) % input.n_block();
    let out_block = in_block % output.n_block();

    args.set_lifecycle(FLUFF_SKEY, "waiting_filled");
    input.wait_filled(in_block)?;

    args.set_lifecycle(FLUFF_SKEY, "waiting_free");
    output.wait_free(out_block)?;

    args.set_lifecycle(FLUFF_SKEY, "processing");
    let in_data = input.data(in_block)?;
    let out_data = output.data_mut(out_block)?;
    copy_header(&in_data[..BLOCK_HEADER_SIZE], out_data)?;
    FLUFF_DIMS.fluff(&in_data[BLOCK_HEADER_SIZE..], &mut out_data[BLOCK_HEADER_SIZE..])?;

    output.set_filled(out_block)?;
    input.set_free(in_block)?;
    args.cursor.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn null_output_run(args: &ThreadArgs, input: Option<&RingDatabuf>, _output: Option<&RingDatabuf>) -> Result<()> {
    let input = input.ok_or_else(|| HpError::fatal("null_output_thread requires an input databuf"))?;

    let block = (args.cursor.load(Ordering::Relaxed) as usize) % input.n_block();

    args.set_lifecycle(NULL_OUTPUT_SKEY, "waiting_filled");
    input.wait_filled(block)?;

    args.set_lifecycle(NULL_OUTPUT_SKEY, "processing");
    input.set_free(block)?;
    args.cursor.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Registers `fluff_thread` and `null_output_thread`. Called once from
/// `main` before any pipeline is built; tests that need their own fake
/// descriptors register those under distinct names instead of calling
/// this.
pub fn register_builtin() -> Result<()> {
    registry::register(ThreadDesc {
        name: "fluff_thread",
        skey: FLUFF_SKEY,
        init: None,
        run: fluff_run,
        ibuf_create: Some(fluff_ibuf_create),
        obuf_create: Some(fluff_obuf_create),
    })?;
    registry::register(ThreadDesc {
        name: "null_output_thread",
        skey: NULL_OUTPUT_SKEY,
        init: None,
        run: null_output_run,
        ibuf_create: Some(null_output_ibuf_create),
        obuf_create: None,
    })?;
    Ok(())
}

use std::{
    env::{self, VarError},
    panic::catch_unwind,
    process,
};

use anyhow::{anyhow, bail, Context};
use image::ImageBuffer;
use once_cell::sync::Lazy;

use super::Image;

/// The JPEG decoding backends a webcam frame can be decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum JpegBackend {
    /// Uses the `jpeg-decoder` crate (through `image`), a robust but slow pure-Rust JPEG decoder.
    JpegDecoder,
    /// Uses the `mozjpeg` crate, a wrapper around Mozilla's libjpeg fork. Robust and fast, but C.
    MozJpeg,
    /// Uses the `zune-jpeg` crate, a pure-Rust JPEG decoder somewhat faster than `jpeg-decoder`.
    ZuneJpeg,
}

const DEFAULT_BACKEND: JpegBackend = JpegBackend::MozJpeg;

static JPEG_BACKEND: Lazy<JpegBackend> = Lazy::new(|| match env::var("HANDCAM_JPEG_BACKEND") {
    Ok(v) if v == "mozjpeg" => JpegBackend::MozJpeg,
    Ok(v) if v == "zune-jpeg" => JpegBackend::ZuneJpeg,
    Ok(v) if v == "jpeg-decoder" => JpegBackend::JpegDecoder,
    Ok(v) => {
        eprintln!("invalid value set for `HANDCAM_JPEG_BACKEND` variable: '{v}'; exiting");
        process::exit(1);
    }
    Err(VarError::NotPresent) => DEFAULT_BACKEND,
    Err(VarError::NotUnicode(s)) => {
        eprintln!(
            "invalid value set for `HANDCAM_JPEG_BACKEND` variable: {}; exiting",
            s.to_string_lossy()
        );
        process::exit(1);
    }
});

pub(super) fn decode_jpeg(data: &[u8]) -> anyhow::Result<Image> {
    decode_jpeg_with(*JPEG_BACKEND, data)
}

pub(super) fn decode_jpeg_with(backend: JpegBackend, data: &[u8]) -> anyhow::Result<Image> {
    let buf = match backend {
        JpegBackend::JpegDecoder => {
            image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgba8()
        }
        JpegBackend::MozJpeg => {
            // mozjpeg crate unfortunately reports errors only via unwinding
            let (buf, width, height) = catch_unwind(|| -> anyhow::Result<_> {
                let mut decompress = mozjpeg::Decompress::new_mem(data)?;

                // Tune settings for decode performance.
                decompress.do_fancy_upsampling(false);
                decompress.dct_method(mozjpeg::DctMethod::IntegerFast);

                let mut decompress = decompress.rgba()?;
                let buf = decompress
                    .read_scanlines_flat()
                    .ok_or_else(|| anyhow!("failed to decode image"))?;
                Ok((buf, decompress.width(), decompress.height()))
            })
            .map_err(|payload| match payload.downcast::<String>() {
                Ok(string) => anyhow::Error::msg(string),
                Err(_) => anyhow!("<unknown panic message>"),
            })??;

            ImageBuffer::from_raw(width.try_into()?, height.try_into()?, buf)
                .context("decoded JPEG buffer does not match its dimensions")?
        }
        JpegBackend::ZuneJpeg => {
            use zune_jpeg::zune_core::colorspace::ColorSpace;
            use zune_jpeg::zune_core::options::DecoderOptions;

            let mut decomp = zune_jpeg::JpegDecoder::new_with_options(
                DecoderOptions::new_fast().jpeg_set_out_colorspace(ColorSpace::RGBA),
                data,
            );
            decomp.decode_headers()?;
            match decomp.get_output_colorspace() {
                Some(ColorSpace::RGBA) => {}
                colorspace => bail!("unsupported colorspace {colorspace:?} (expected RGBA)"),
            }

            let size = decomp
                .output_buffer_size()
                .context("JPEG headers were not decoded")?;
            let mut buf = vec![0; size];
            decomp.decode_into(&mut buf)?;
            let (width, height) = decomp
                .dimensions()
                .context("JPEG headers were not decoded")?;
            ImageBuffer::from_raw(width.into(), height.into(), buf)
                .context("decoded JPEG buffer does not match its dimensions")?
        }
    };

    Ok(Image { buf })
}

//! FITS access on top of cfitsio.
//!
//! cfitsio owns the file format, tile compression included; this module adds
//! the header-record view the tools work with and the handful of raw calls
//! the safe `fitsio` API does not cover.

pub mod header;

use std::ffi::{c_char, c_int, CString, NulError};
use std::path::{Path, PathBuf};

use fitsio::errors::check_status as fits_check_status;
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use thiserror::Error;

pub use header::{Card, HduKind, Header, Value, CARD_LEN};

#[derive(Debug, Error)]
pub enum FitsError {
    #[error(transparent)]
    Fitsio(#[from] fitsio::errors::Error),

    #[error(transparent)]
    Nul(#[from] NulError),

    #[error("malformed FITS: {0}")]
    Malformed(String),

    #[error("missing required keyword {0}")]
    MissingKeyword(String),

    #[error("unsupported BITPIX {0}")]
    UnsupportedBitpix(i64),

    #[error("refusing to overwrite existing file {}", .0.display())]
    Exists(PathBuf),

    #[error("expected {expected} pixels, found {actual}")]
    PixelCount { expected: usize, actual: usize },
}

/// Pixel values of one image, typed by BITPIX
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Pixels {
    pub fn bitpix(&self) -> i64 {
        match self {
            Pixels::U8(_) => 8,
            Pixels::I16(_) => 16,
            Pixels::I32(_) => 32,
            Pixels::I64(_) => 64,
            Pixels::F32(_) => -32,
            Pixels::F64(_) => -64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Pixels::U8(v) => v.len(),
            Pixels::I16(v) => v.len(),
            Pixels::I32(v) => v.len(),
            Pixels::I64(v) => v.len(),
            Pixels::F32(v) => v.len(),
            Pixels::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn image_type(bitpix: i64) -> Result<ImageType, FitsError> {
    match bitpix {
        8 => Ok(ImageType::UnsignedByte),
        16 => Ok(ImageType::Short),
        32 => Ok(ImageType::Long),
        64 => Ok(ImageType::LongLong),
        -32 => Ok(ImageType::Float),
        -64 => Ok(ImageType::Double),
        other => Err(FitsError::UnsupportedBitpix(other)),
    }
}

/// fitsio describes shapes slowest axis first, FITS headers fastest first
fn c_order(axes: &[usize]) -> Vec<usize> {
    axes.iter().rev().copied().collect()
}

pub fn hdu_count(fptr: &mut FitsFile) -> Result<usize, FitsError> {
    let mut status = 0;
    let mut count: c_int = 0;
    unsafe {
        // ffthdu = fits_get_num_hdus
        fitsio_sys::ffthdu(
            fptr.as_raw(), /* I - FITS file pointer   */
            &mut count,    /* O - number of HDUs      */
            &mut status,   /* IO - error status       */
        );
    }
    fits_check_status(status)?;
    Ok(count.max(0) as usize)
}

/// Every record of HDU `index` in file order, blank records included
pub fn read_header(fptr: &mut FitsFile, index: usize) -> Result<Header, FitsError> {
    fptr.hdu(index)?;
    let mut status = 0;
    let mut nexist: c_int = 0;
    let mut nmore: c_int = 0;
    unsafe {
        // ffghsp = fits_get_hdrspace
        fitsio_sys::ffghsp(
            fptr.as_raw(), /* I - FITS file pointer              */
            &mut nexist,   /* O - number of existing keywords    */
            &mut nmore,    /* O - space for more keywords        */
            &mut status,   /* IO - error status                  */
        );
    }
    fits_check_status(status)?;

    let mut cards = Vec::with_capacity(nexist.max(0) as usize);
    let mut record = vec![0u8; CARD_LEN + 1];
    for n in 1..=nexist {
        unsafe {
            // ffgrec = fits_read_record
            fitsio_sys::ffgrec(
                fptr.as_raw(),                      /* I - FITS file pointer  */
                n,                                  /* I - record number      */
                record.as_mut_ptr() as *mut c_char, /* O - card record        */
                &mut status,                        /* IO - error status      */
            );
        }
        fits_check_status(status)?;
        let end = record.iter().position(|&b| b == 0).unwrap_or(record.len());
        cards.push(Card::from_record(&String::from_utf8_lossy(&record[..end]))?);
    }
    Ok(Header::from_cards(cards))
}

pub fn read_headers(fptr: &mut FitsFile) -> Result<Vec<Header>, FitsError> {
    (0..hdu_count(fptr)?)
        .map(|index| read_header(fptr, index))
        .collect()
}

/// Append records verbatim to the header of HDU `index`
pub fn write_cards(fptr: &mut FitsFile, index: usize, cards: &[Card]) -> Result<(), FitsError> {
    fptr.hdu(index)?;
    for card in cards {
        let record = CString::new(card.record())?;
        let mut status = 0;
        unsafe {
            // ffprec = fits_write_record
            fitsio_sys::ffprec(
                fptr.as_raw(),     /* I - FITS file pointer  */
                record.as_ptr(),   /* I - card record        */
                &mut status,       /* IO - error status      */
            );
        }
        fits_check_status(status)?;
    }
    Ok(())
}

/// HISTORY cards; cfitsio continues long lines over several records
pub fn write_history(fptr: &mut FitsFile, index: usize, lines: &[String]) -> Result<(), FitsError> {
    fptr.hdu(index)?;
    for line in lines {
        let history = CString::new(line.as_str())?;
        let mut status = 0;
        unsafe {
            // ffphis = fits_write_history
            fitsio_sys::ffphis(
                fptr.as_raw(),
                history.as_ptr(), /* I - history string     */
                &mut status,      /* IO - error status      */
            );
        }
        fits_check_status(status)?;
    }
    Ok(())
}

/// Set a real keyword in HDU `index`, in place when it already exists
pub fn update_real(
    fptr: &mut FitsFile,
    index: usize,
    keyname: &str,
    value: f64,
    comment: Option<&str>,
) -> Result<(), FitsError> {
    fptr.hdu(index)?;
    let keyname = CString::new(keyname)?;
    let comment = comment.map(CString::new).transpose()?;
    let mut status = 0;
    unsafe {
        // ffukyd = fits_update_key_dbl
        fitsio_sys::ffukyd(
            fptr.as_raw(),                                                    /* I - FITS file pointer  */
            keyname.as_ptr(),                                                 /* I - keyword name       */
            value,                                                            /* I - keyword value      */
            -15,                                                              /* I - no of decimals     */
            comment.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()), /* I - keyword comment    */
            &mut status,                                                      /* IO - error status      */
        );
    }
    fits_check_status(status)?;
    Ok(())
}

pub fn update_integer(
    fptr: &mut FitsFile,
    index: usize,
    keyname: &str,
    value: i64,
    comment: Option<&str>,
) -> Result<(), FitsError> {
    fptr.hdu(index)?;
    let keyname = CString::new(keyname)?;
    let comment = comment.map(CString::new).transpose()?;
    let mut status = 0;
    unsafe {
        // ffukyj = fits_update_key_lng
        fitsio_sys::ffukyj(
            fptr.as_raw(),                                                    /* I - FITS file pointer  */
            keyname.as_ptr(),                                                 /* I - keyword name       */
            value,                                                            /* I - keyword value      */
            comment.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()), /* I - keyword comment    */
            &mut status,                                                      /* IO - error status      */
        );
    }
    fits_check_status(status)?;
    Ok(())
}

/// New file whose primary HDU is an image of `bitpix` and `axes`; an empty
/// `axes` gives a header-only primary
pub fn create_file(
    path: &Path,
    overwrite: bool,
    bitpix: i64,
    axes: &[usize],
) -> Result<FitsFile, FitsError> {
    if path.exists() && !overwrite {
        return Err(FitsError::Exists(path.to_path_buf()));
    }
    let dimensions = c_order(axes);
    let description = ImageDescription {
        data_type: image_type(bitpix)?,
        dimensions: &dimensions,
    };
    let mut builder = FitsFile::create(path).with_custom_primary(&description);
    if overwrite {
        builder = builder.overwrite();
    }
    Ok(builder.open()?)
}

/// Append an image extension and return its index. Unlike
/// `FitsFile::create_image` this writes no EXTNAME.
pub fn create_image_extension(
    fptr: &mut FitsFile,
    bitpix: i64,
    axes: &[usize],
) -> Result<usize, FitsError> {
    image_type(bitpix)?;
    let bitpix = c_int::try_from(bitpix).map_err(|_| FitsError::UnsupportedBitpix(bitpix))?;
    let naxis = c_int::try_from(axes.len())
        .map_err(|_| FitsError::Malformed(format!("{} axes", axes.len())))?;
    let mut naxes = axes
        .iter()
        .map(|&n| {
            i64::try_from(n).map_err(|_| FitsError::Malformed(format!("axis length {}", n)))
        })
        .collect::<Result<Vec<i64>, _>>()?;

    // append after the last HDU
    let last = hdu_count(fptr)?.saturating_sub(1);
    fptr.hdu(last)?;
    let mut status = 0;
    unsafe {
        // ffcrimll = fits_create_imgll
        fitsio_sys::ffcrimll(
            fptr.as_raw(),      /* I - FITS file pointer           */
            bitpix,             /* I - bits per pixel              */
            naxis,              /* I - number of axes              */
            naxes.as_mut_ptr(), /* I - axis lengths, fastest first */
            &mut status,        /* IO - error status               */
        );
    }
    fits_check_status(status)?;
    Ok(hdu_count(fptr)? - 1)
}

/// Append HDU `index` of `input` to `output` unchanged
pub fn copy_hdu(input: &mut FitsFile, index: usize, output: &mut FitsFile) -> Result<(), FitsError> {
    input.hdu(index)?;
    let last = hdu_count(output)?.saturating_sub(1);
    output.hdu(last)?;
    let mut status = 0;
    unsafe {
        // ffcopy = fits_copy_hdu
        fitsio_sys::ffcopy(
            input.as_raw(),  /* I - input FITS file pointer   */
            output.as_raw(), /* I - output FITS file pointer  */
            0,               /* I - reserve space for keys    */
            &mut status,     /* IO - error status             */
        );
    }
    fits_check_status(status)?;
    Ok(())
}

/// Read values as stored, ignoring BSCALE/BZERO, so that copying an
/// integer image with its scaling keywords is exact
fn disable_scaling(fptr: &mut FitsFile) -> Result<(), FitsError> {
    let mut status = 0;
    unsafe {
        // ffpscl = fits_set_bscale
        fitsio_sys::ffpscl(
            fptr.as_raw(), /* I - FITS file pointer  */
            1.0,           /* I - scale              */
            0.0,           /* I - zero               */
            &mut status,   /* IO - error status      */
        );
    }
    fits_check_status(status)?;
    Ok(())
}

/// Pixels of image HDU `index`, compressed or not. Null floating-point
/// pixels come back as NaN.
pub fn read_pixels(fptr: &mut FitsFile, index: usize, header: &Header) -> Result<Pixels, FitsError> {
    let bitpix = header.image_bitpix()?;
    let count = header.pixel_count()?;
    let nelem = i64::try_from(count)
        .map_err(|_| FitsError::Malformed(format!("{} pixels do not fit one read", count)))?;
    let hdu = fptr.hdu(index)?;
    disable_scaling(fptr)?;

    let pixels = match bitpix {
        8 => Pixels::U8(hdu.read_image(fptr)?),
        16 => Pixels::I16(hdu.read_image(fptr)?),
        32 => Pixels::I32(hdu.read_image(fptr)?),
        64 => Pixels::I64(hdu.read_image(fptr)?),
        -32 => {
            let mut values = vec![0f32; count];
            let mut status = 0;
            unsafe {
                // ffgpve = fits_read_img_flt
                fitsio_sys::ffgpve(
                    fptr.as_raw(),        /* I - FITS file pointer                       */
                    1,                    /* I - group to read (1 = 1st group)           */
                    1,                    /* I - first vector element to read (1 = 1st)  */
                    nelem,                /* I - number of values to read                */
                    f32::NAN,             /* I - value for undefined pixels              */
                    values.as_mut_ptr(),  /* O - array of values that are returned       */
                    &mut 0,               /* O - set to 1 if any values are null; else 0 */
                    &mut status,          /* IO - error status                           */
                );
            }
            fits_check_status(status)?;
            Pixels::F32(values)
        }
        -64 => {
            let mut values = vec![0f64; count];
            let mut status = 0;
            unsafe {
                // ffgpvd = fits_read_img_dbl
                fitsio_sys::ffgpvd(
                    fptr.as_raw(),        /* I - FITS file pointer                       */
                    1,                    /* I - group to read (1 = 1st group)           */
                    1,                    /* I - first vector element to read (1 = 1st)  */
                    nelem,                /* I - number of values to read                */
                    f64::NAN,             /* I - value for undefined pixels              */
                    values.as_mut_ptr(),  /* O - array of values that are returned       */
                    &mut 0,               /* O - set to 1 if any values are null; else 0 */
                    &mut status,          /* IO - error status                           */
                );
            }
            fits_check_status(status)?;
            Pixels::F64(values)
        }
        other => return Err(FitsError::UnsupportedBitpix(other)),
    };

    if pixels.len() != count {
        return Err(FitsError::PixelCount {
            expected: count,
            actual: pixels.len(),
        });
    }
    Ok(pixels)
}

/// Write the whole data unit of image HDU `index`. Its header must be
/// complete first: BSCALE/BZERO/BLANK are re-read but not applied.
pub fn write_pixels(fptr: &mut FitsFile, index: usize, pixels: &Pixels) -> Result<(), FitsError> {
    let hdu = fptr.hdu(index)?;
    let mut status = 0;
    unsafe {
        // ffrdef = fits_set_hdustruc
        fitsio_sys::ffrdef(
            fptr.as_raw(), /* I - FITS file pointer  */
            &mut status,   /* IO - error status      */
        );
    }
    fits_check_status(status)?;
    disable_scaling(fptr)?;

    match pixels {
        Pixels::U8(v) => hdu.write_image(fptr, v)?,
        Pixels::I16(v) => hdu.write_image(fptr, v)?,
        Pixels::I32(v) => hdu.write_image(fptr, v)?,
        Pixels::I64(v) => hdu.write_image(fptr, v)?,
        Pixels::F32(v) => hdu.write_image(fptr, v)?,
        Pixels::F64(v) => hdu.write_image(fptr, v)?,
    }
    Ok(())
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("transform expects RGB pixels but the image is already a tensor")]
    ExpectedPixels,

    #[error("transform expects a tensor image; apply ToTensor first")]
    ExpectedTensor,

    #[error("invalid annotation: {0}")]
    InvalidAnnotation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

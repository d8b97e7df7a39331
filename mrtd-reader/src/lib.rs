//! Reading and verifying the contactless chip of electronic travel documents (ICAO Doc 9303).
//!
//! The entry point is [`session::Engine`], which drives a platform-supplied
//! [`transport::Transport`] through access control, file reading, face image extraction and
//! passive authentication, ending in a [`result::ScanResult`].


pub mod bac;
pub mod cancellation;
pub mod config;
pub mod crypt;
pub mod der_util;
pub mod face_image;
pub mod iso7816;
pub mod lds;
pub mod master_list;
pub mod mrz;
pub mod negotiation;
pub mod pace;
pub mod passive_auth;
pub mod reader;
pub mod result;
pub mod secure_messaging;
pub mod session;
pub mod transport;

mod basics;
mod common;
mod lifecycle;

pub mod noso;

pub mod xdeployment;
